use anyhow::Context;
use bridge_control::{SmoothingConfig, SmoothingPreset};
use bridge_core::{BridgeError, BridgeResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Rate the background poller reads the telemetry source at.
    pub telemetry_hz: f64,
    /// Rate of RL steps.
    pub control_hz: f64,
    /// Wait after the session restart before the episode starts.
    pub settle_ms: u64,
    /// Gear selected after a reset (0=R, 1=N, 2=first). None leaves it alone.
    pub initial_gear: Option<i8>,
    pub first_frame_timeout_ms: u64,
    pub source_timeout_ms: u64,
    /// Frames older than this are flagged stale. Defaults to two telemetry
    /// periods rather than one: the poller sleeps a full period after each
    /// read, so a healthy frame is routinely read slightly more than one
    /// period after capture. A single missed poll still crosses the default.
    /// Set `Some(1000 / telemetry_hz)` for the strict one-interval rule.
    pub stale_after_ms: Option<u64>,
    pub overrun_tolerance: f64,
    /// Named preset; overrides `smoothing` when set.
    pub smoothing_preset: Option<SmoothingPreset>,
    pub smoothing: SmoothingConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            telemetry_hz: 60.0,
            control_hz: 10.0,
            settle_ms: 5_000,
            initial_gear: Some(2),
            first_frame_timeout_ms: 5_000,
            source_timeout_ms: 250,
            stale_after_ms: None,
            overrun_tolerance: bridge_timing::DEFAULT_OVERRUN_TOLERANCE,
            smoothing_preset: None,
            smoothing: SmoothingConfig::moderate(),
        }
    }
}

impl BridgeConfig {
    pub fn from_json_file(path: &Path) -> BridgeResult<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read bridge config {}", path.display()))?;
        let cfg: BridgeConfig = serde_json::from_str(&text)
            .with_context(|| format!("parse bridge config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> BridgeResult<()> {
        for (name, hz) in [("telemetry_hz", self.telemetry_hz), ("control_hz", self.control_hz)] {
            if !hz.is_finite() || hz <= 0.0 {
                return Err(BridgeError::Configuration(format!("{name} must be positive, got {hz}")));
            }
        }
        if self.source_timeout_ms == 0 {
            return Err(BridgeError::Configuration("source_timeout_ms must be non-zero".into()));
        }
        if !self.overrun_tolerance.is_finite() || self.overrun_tolerance < 0.0 {
            return Err(BridgeError::Configuration(format!(
                "overrun_tolerance must be >= 0, got {}",
                self.overrun_tolerance
            )));
        }
        self.smoothing().validate()
    }

    pub fn smoothing(&self) -> SmoothingConfig {
        self.smoothing_preset.map(SmoothingConfig::preset).unwrap_or(self.smoothing)
    }

    pub fn settle_time(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn first_frame_timeout(&self) -> Duration {
        Duration::from_millis(self.first_frame_timeout_ms)
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.source_timeout_ms)
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_secs_f64(2.0 / self.telemetry_hz))
    }
}
