//! Action smoothing: hard clamp, rate limit, EMA, final clamp.
//!
//! The policy chooses targets; the smoother decides how fast the controls
//! move toward them.

use bridge_core::{ActionCommand, BridgeError, BridgeResult, RawAction};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// Every recognised smoothing option. Deltas are per-step limits; alphas
/// weight the new value in the EMA (1.0 means no smoothing).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    pub enable_rate_limiting: bool,
    pub max_steer_delta: f32,
    pub max_throttle_up: f32,
    pub max_throttle_down: f32,
    pub max_brake_up: f32,
    pub max_brake_down: f32,
    pub max_clutch_delta: f32,

    pub enable_ema: bool,
    pub steer_alpha: f32,
    pub throttle_alpha: f32,
    pub brake_alpha: f32,
    pub clutch_alpha: f32,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self::moderate()
    }
}

impl SmoothingConfig {
    /// Very smooth, human-like inputs; good for early training.
    pub fn conservative() -> Self {
        Self {
            max_steer_delta: 0.10,
            max_throttle_up: 0.08,
            max_throttle_down: 0.20,
            max_brake_up: 0.25,
            max_brake_down: 0.08,
            steer_alpha: 0.5,
            throttle_alpha: 0.6,
            brake_alpha: 0.6,
            ..Self::moderate()
        }
    }

    pub fn moderate() -> Self {
        Self {
            enable_rate_limiting: true,
            // full lock in ~0.7s at 10 Hz
            max_steer_delta: 0.15,
            max_throttle_up: 0.10,
            max_throttle_down: 0.25,
            // brake goes on fast and comes off slowly
            max_brake_up: 0.30,
            max_brake_down: 0.10,
            max_clutch_delta: 0.50,
            enable_ema: true,
            steer_alpha: 0.6,
            throttle_alpha: 0.7,
            brake_alpha: 0.7,
            clutch_alpha: 0.8,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            max_steer_delta: 0.20,
            max_throttle_up: 0.15,
            max_throttle_down: 0.30,
            max_brake_up: 0.40,
            max_brake_down: 0.15,
            steer_alpha: 0.7,
            throttle_alpha: 0.8,
            brake_alpha: 0.8,
            ..Self::moderate()
        }
    }

    /// Hard clamps only.
    pub fn none() -> Self {
        Self { enable_rate_limiting: false, enable_ema: false, ..Self::moderate() }
    }

    pub fn preset(preset: SmoothingPreset) -> Self {
        match preset {
            SmoothingPreset::Conservative => Self::conservative(),
            SmoothingPreset::Moderate => Self::moderate(),
            SmoothingPreset::Aggressive => Self::aggressive(),
            SmoothingPreset::None => Self::none(),
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        let deltas = [
            ("max_steer_delta", self.max_steer_delta),
            ("max_throttle_up", self.max_throttle_up),
            ("max_throttle_down", self.max_throttle_down),
            ("max_brake_up", self.max_brake_up),
            ("max_brake_down", self.max_brake_down),
            ("max_clutch_delta", self.max_clutch_delta),
        ];
        for (name, v) in deltas {
            if !v.is_finite() || v <= 0.0 {
                return Err(BridgeError::Configuration(format!("{name} must be finite and > 0, got {v}")));
            }
        }
        let alphas = [
            ("steer_alpha", self.steer_alpha),
            ("throttle_alpha", self.throttle_alpha),
            ("brake_alpha", self.brake_alpha),
            ("clutch_alpha", self.clutch_alpha),
        ];
        for (name, v) in alphas {
            if !v.is_finite() || v <= 0.0 || v > 1.0 {
                return Err(BridgeError::Configuration(format!("{name} must be in (0, 1], got {v}")));
            }
        }
        Ok(())
    }

    fn channels(&self) -> [Channel; 4] {
        let rl = self.enable_rate_limiting;
        let ema = self.enable_ema;
        [
            Channel::new(-1.0, 1.0, self.max_steer_delta, self.max_steer_delta, self.steer_alpha, rl, ema),
            Channel::new(0.0, 1.0, self.max_throttle_up, self.max_throttle_down, self.throttle_alpha, rl, ema),
            Channel::new(0.0, 1.0, self.max_brake_up, self.max_brake_down, self.brake_alpha, rl, ema),
            Channel::new(0.0, 1.0, self.max_clutch_delta, self.max_clutch_delta, self.clutch_alpha, rl, ema),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmoothingPreset {
    Conservative,
    Moderate,
    Aggressive,
    None,
}

impl FromStr for SmoothingPreset {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "moderate" => Ok(Self::Moderate),
            "aggressive" => Ok(Self::Aggressive),
            "none" | "off" => Ok(Self::None),
            other => Err(BridgeError::Configuration(format!("unknown smoothing preset '{other}'"))),
        }
    }
}

impl fmt::Display for SmoothingPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SmoothingPreset::Conservative => write!(f, "conservative"),
            SmoothingPreset::Moderate => write!(f, "moderate"),
            SmoothingPreset::Aggressive => write!(f, "aggressive"),
            SmoothingPreset::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Channel {
    min: f32,
    max: f32,
    max_up: f32,
    max_down: f32,
    alpha: f32,
    rate_limit: bool,
    ema: bool,
}

impl Channel {
    fn new(min: f32, max: f32, max_up: f32, max_down: f32, alpha: f32, rate_limit: bool, ema: bool) -> Self {
        Self { min, max, max_up, max_down, alpha, rate_limit, ema }
    }

    fn filter(&self, raw: f32, prev: f32) -> f32 {
        // NaN maps to the neutral position; clamp() would pass it through
        let raw = if raw.is_nan() { 0.0 } else { raw };
        let target = raw.clamp(self.min, self.max);

        let limited = if self.rate_limit {
            let delta = target - prev;
            if delta > 0.0 {
                prev + delta.min(self.max_up)
            } else {
                prev + delta.max(-self.max_down)
            }
        } else {
            target
        };

        let smoothed = if self.ema {
            self.alpha * limited + (1.0 - self.alpha) * prev
        } else {
            limited
        };

        smoothed.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SmootherStats {
    pub step_count: u64,
    pub avg_steer_delta: f64,
    pub avg_throttle_delta: f64,
    pub avg_brake_delta: f64,
    pub avg_clutch_delta: f64,
    pub rate_limiting: bool,
    pub ema: bool,
    pub max_steer_delta: f32,
}

/// Stateful per-channel filter from raw policy actions to safe commands.
pub struct ActionSmoother {
    config: SmoothingConfig,
    channels: [Channel; 4],
    previous: ActionCommand,
    step_count: u64,
    total_delta: [f64; 4],
}

impl ActionSmoother {
    pub fn new(config: SmoothingConfig) -> BridgeResult<Self> {
        config.validate()?;
        info!(
            rate_limiting = config.enable_rate_limiting,
            ema = config.enable_ema,
            max_steer_delta = config.max_steer_delta,
            "action smoother initialized"
        );
        Ok(Self {
            channels: config.channels(),
            config,
            previous: ActionCommand::NEUTRAL,
            step_count: 0,
            total_delta: [0.0; 4],
        })
    }

    pub fn with_preset(preset: SmoothingPreset) -> BridgeResult<Self> {
        Self::new(SmoothingConfig::preset(preset))
    }

    /// Replace the configuration. Filter state is kept; an invalid config
    /// leaves the current one in place.
    pub fn configure(&mut self, config: SmoothingConfig) -> BridgeResult<()> {
        config.validate()?;
        self.channels = config.channels();
        self.config = config;
        debug!(?config, "action smoother reconfigured");
        Ok(())
    }

    pub fn config(&self) -> &SmoothingConfig {
        &self.config
    }

    /// Last command produced (neutral after construction or reset).
    pub fn previous(&self) -> ActionCommand {
        self.previous
    }

    pub fn filter(&mut self, raw: &RawAction) -> ActionCommand {
        let [steer, throttle, brake, clutch] = &self.channels;
        let prev = self.previous;
        let out = ActionCommand {
            steer: steer.filter(raw.steer, prev.steer),
            throttle: throttle.filter(raw.throttle, prev.throttle),
            brake: brake.filter(raw.brake, prev.brake),
            clutch: clutch.filter(raw.clutch, prev.clutch),
        };

        let deltas = [
            out.steer - prev.steer,
            out.throttle - prev.throttle,
            out.brake - prev.brake,
            out.clutch - prev.clutch,
        ];
        for (total, d) in self.total_delta.iter_mut().zip(deltas) {
            *total += d.abs() as f64;
        }
        self.step_count += 1;
        self.previous = out;
        out
    }

    /// Return every channel to neutral. Call at each episode boundary, or
    /// the first action of the new episode ramps from the old state.
    pub fn reset(&mut self) {
        self.previous = ActionCommand::NEUTRAL;
        info!("action smoother reset");
    }

    pub fn stats(&self) -> SmootherStats {
        let n = self.step_count.max(1) as f64;
        SmootherStats {
            step_count: self.step_count,
            avg_steer_delta: self.total_delta[0] / n,
            avg_throttle_delta: self.total_delta[1] / n,
            avg_brake_delta: self.total_delta[2] / n,
            avg_clutch_delta: self.total_delta[3] / n,
            rate_limiting: self.config.enable_rate_limiting,
            ema: self.config.enable_ema,
            max_steer_delta: self.config.max_steer_delta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPS: f32 = 1e-6;

    fn smoother(config: SmoothingConfig) -> ActionSmoother {
        ActionSmoother::new(config).unwrap()
    }

    #[test]
    fn test_step_input_ramps_within_steer_limit() {
        let mut s = smoother(SmoothingConfig { max_steer_delta: 0.1, ..SmoothingConfig::moderate() });
        let target = RawAction::new(1.0, 1.0, 0.0);
        let mut prev = 0.0_f32;
        let mut reached_at = None;
        for step in 1..=50 {
            let out = s.filter(&target);
            assert!(out.steer >= prev, "step {step}: {} < {prev}", out.steer);
            assert!(out.steer - prev <= 0.1 + EPS);
            if reached_at.is_none() && out.steer >= 1.0 - EPS {
                reached_at = Some(step);
            }
            prev = out.steer;
        }
        assert!(reached_at.map_or(true, |n| n >= 10), "reached at {reached_at:?}");
        assert!(prev > 0.99, "steer only reached {prev}");
    }

    #[test]
    fn test_asymmetric_pedal_limits() {
        let mut s = smoother(SmoothingConfig { enable_ema: false, ..SmoothingConfig::moderate() });
        let on = s.filter(&RawAction::new(0.0, 1.0, 1.0));
        assert!((on.throttle - 0.10).abs() < EPS);
        assert!((on.brake - 0.30).abs() < EPS);

        for _ in 0..20 {
            s.filter(&RawAction::new(0.0, 1.0, 1.0));
        }
        let off = s.filter(&RawAction::new(0.0, 0.0, 0.0));
        assert!((off.throttle - 0.75).abs() < EPS);
        assert!((off.brake - 0.90).abs() < EPS);
    }

    #[test]
    fn test_none_preset_only_clamps() {
        let mut s = ActionSmoother::with_preset(SmoothingPreset::None).unwrap();
        let out = s.filter(&RawAction { steer: -3.0, throttle: 0.4, brake: 7.0, clutch: -1.0 });
        assert_eq!(out, ActionCommand { steer: -1.0, throttle: 0.4, brake: 1.0, clutch: 0.0 });
    }

    #[test]
    fn test_nan_input_maps_to_neutral() {
        let mut s = ActionSmoother::with_preset(SmoothingPreset::None).unwrap();
        let out = s.filter(&RawAction { steer: f32::NAN, throttle: f32::NAN, brake: f32::INFINITY, clutch: f32::NEG_INFINITY });
        assert_eq!(out, ActionCommand { steer: 0.0, throttle: 0.0, brake: 1.0, clutch: 0.0 });
    }

    #[test]
    fn test_reset_restores_neutral_reference() {
        let mut s = smoother(SmoothingConfig { enable_ema: false, ..SmoothingConfig::moderate() });
        for _ in 0..20 {
            s.filter(&RawAction::new(1.0, 0.0, 0.0));
        }
        assert_eq!(s.previous().steer, 1.0);
        s.reset();
        assert_eq!(s.previous(), ActionCommand::NEUTRAL);
        // ramp starts from neutral, not from the pre-reset full lock
        let out = s.filter(&RawAction::new(-1.0, 0.0, 0.0));
        assert!((out.steer + 0.15).abs() < EPS, "{}", out.steer);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let bad = [
            SmoothingConfig { max_steer_delta: 0.0, ..SmoothingConfig::moderate() },
            SmoothingConfig { max_brake_down: f32::NAN, ..SmoothingConfig::moderate() },
            SmoothingConfig { throttle_alpha: 1.5, ..SmoothingConfig::moderate() },
            SmoothingConfig { clutch_alpha: 0.0, ..SmoothingConfig::moderate() },
        ];
        for cfg in bad {
            assert!(matches!(ActionSmoother::new(cfg), Err(BridgeError::Configuration(_))));
        }
        let mut s = smoother(SmoothingConfig::moderate());
        assert!(s.configure(SmoothingConfig { steer_alpha: -1.0, ..SmoothingConfig::moderate() }).is_err());
        assert_eq!(s.config(), &SmoothingConfig::moderate());
        s.configure(SmoothingConfig::aggressive()).unwrap();
        assert_eq!(s.config().max_steer_delta, 0.20);
    }

    #[test]
    fn test_presets_by_name_and_from_json() {
        assert_eq!("Conservative".parse::<SmoothingPreset>().unwrap(), SmoothingPreset::Conservative);
        assert_eq!("off".parse::<SmoothingPreset>().unwrap(), SmoothingPreset::None);
        assert!("snappy".parse::<SmoothingPreset>().is_err());
        assert_eq!(SmoothingPreset::Aggressive.to_string(), "aggressive");

        let cfg: SmoothingConfig = serde_json::from_str(r#"{"max_steer_delta": 0.05, "enable_ema": false}"#).unwrap();
        assert_eq!(cfg.max_steer_delta, 0.05);
        assert!(!cfg.enable_ema);
        assert_eq!(cfg.max_brake_up, SmoothingConfig::moderate().max_brake_up);
    }

    #[test]
    fn test_stats_track_average_delta() {
        let mut s = ActionSmoother::with_preset(SmoothingPreset::None).unwrap();
        s.filter(&RawAction::new(0.5, 0.0, 0.0));
        s.filter(&RawAction::new(0.5, 0.0, 0.0));
        let st = s.stats();
        assert_eq!(st.step_count, 2);
        assert!((st.avg_steer_delta - 0.25).abs() < 1e-9);
        assert_eq!(st.avg_brake_delta, 0.0);
        assert!(!st.rate_limiting);
    }

    fn within_limit(now: f32, before: f32, up: f32, down: f32) -> bool {
        let d = now - before;
        if d > 0.0 {
            d <= up + EPS
        } else {
            -d <= down + EPS
        }
    }

    fn any_raw() -> impl Strategy<Value = RawAction> {
        let v = prop_oneof![
            proptest::num::f32::ANY,
            -2.0f32..2.0f32,
            Just(f32::NAN),
            Just(-0.0f32),
        ];
        (v.clone(), v.clone(), v.clone(), v).prop_map(|(steer, throttle, brake, clutch)| RawAction {
            steer,
            throttle,
            brake,
            clutch,
        })
    }

    fn any_config() -> impl Strategy<Value = SmoothingConfig> {
        prop_oneof![
            Just(SmoothingConfig::conservative()),
            Just(SmoothingConfig::moderate()),
            Just(SmoothingConfig::aggressive()),
            Just(SmoothingConfig::none()),
            Just(SmoothingConfig { enable_ema: false, ..SmoothingConfig::moderate() }),
        ]
    }

    proptest! {
        #[test]
        fn prop_output_always_within_bounds(cfg in any_config(), actions in proptest::collection::vec(any_raw(), 1..64)) {
            let mut s = smoother(cfg);
            for a in &actions {
                let out = s.filter(a);
                prop_assert!(out.is_within_bounds(), "{:?} -> {:?}", a, out);
            }
        }

        #[test]
        fn prop_rate_limit_holds_per_direction(actions in proptest::collection::vec(any_raw(), 1..64), ema in any::<bool>()) {
            let cfg = SmoothingConfig { enable_ema: ema, ..SmoothingConfig::moderate() };
            let mut s = smoother(cfg);
            let mut prev = ActionCommand::NEUTRAL;
            for a in &actions {
                let out = s.filter(a);
                prop_assert!(within_limit(out.steer, prev.steer, cfg.max_steer_delta, cfg.max_steer_delta),
                    "steer {} -> {}", prev.steer, out.steer);
                prop_assert!(within_limit(out.throttle, prev.throttle, cfg.max_throttle_up, cfg.max_throttle_down),
                    "throttle {} -> {}", prev.throttle, out.throttle);
                prop_assert!(within_limit(out.brake, prev.brake, cfg.max_brake_up, cfg.max_brake_down),
                    "brake {} -> {}", prev.brake, out.brake);
                prop_assert!(within_limit(out.clutch, prev.clutch, cfg.max_clutch_delta, cfg.max_clutch_delta),
                    "clutch {} -> {}", prev.clutch, out.clutch);
                prev = out;
            }
        }
    }
}
