use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// One named value copied out of the telemetry source.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Int(i64),
    Scalar(f64),
    Vector(Vec<f64>),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Scalar(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            FieldValue::Vector(v) => Some(v),
            _ => None,
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self { FieldValue::Scalar(v) }
}
impl From<f32> for FieldValue {
    fn from(v: f32) -> Self { FieldValue::Scalar(v as f64) }
}
impl From<i64> for FieldValue {
    fn from(v: i64) -> Self { FieldValue::Int(v) }
}
impl From<bool> for FieldValue {
    fn from(v: bool) -> Self { FieldValue::Flag(v) }
}
impl From<Vec<f64>> for FieldValue {
    fn from(v: Vec<f64>) -> Self { FieldValue::Vector(v) }
}

pub type NamedFields = BTreeMap<String, FieldValue>;

/// A timestamped telemetry snapshot. Never mutated after construction;
/// the next poll supersedes it with a new frame.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TelemetryFrame {
    pub sequence: u64,
    /// Monotonic capture time, measured from the bridge clock origin.
    pub captured_at: Duration,
    pub target_interval: Duration,
    /// Time since the previous successful poll.
    pub actual_interval: Duration,
    #[serde(default)]
    pub fields: NamedFields,
}

impl TelemetryFrame {
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    pub fn scalar(&self, name: &str) -> Option<f64> {
        self.fields.get(name).and_then(FieldValue::as_f64)
    }

    /// Age of the frame relative to `now` (same clock origin as `captured_at`).
    pub fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.captured_at)
    }

    pub fn is_stale(&self, now: Duration, threshold: Duration) -> bool {
        self.age(now) > threshold
    }
}

/// Unfiltered action as produced by a policy. May hold any value,
/// including out-of-range or NaN components.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct RawAction {
    pub steer: f32,
    pub throttle: f32,
    pub brake: f32,
    #[serde(default)]
    pub clutch: f32,
}

impl RawAction {
    pub fn new(steer: f32, throttle: f32, brake: f32) -> Self {
        Self { steer, throttle, brake, clutch: 0.0 }
    }

    /// Accepts `[steer, throttle, brake]` or `[steer, throttle, brake, clutch]`.
    /// Returns the component count on failure.
    pub fn from_slice(action: &[f32]) -> Result<Self, usize> {
        match action {
            [steer, throttle, brake] => Ok(Self::new(*steer, *throttle, *brake)),
            [steer, throttle, brake, clutch, ..] => Ok(Self {
                steer: *steer,
                throttle: *throttle,
                brake: *brake,
                clutch: *clutch,
            }),
            _ => Err(action.len()),
        }
    }

    pub fn is_in_range(&self) -> bool {
        STEER_RANGE.contains(&self.steer)
            && PEDAL_RANGE.contains(&self.throttle)
            && PEDAL_RANGE.contains(&self.brake)
            && PEDAL_RANGE.contains(&self.clutch)
    }
}

pub const STEER_RANGE: std::ops::RangeInclusive<f32> = -1.0..=1.0;
pub const PEDAL_RANGE: std::ops::RangeInclusive<f32> = 0.0..=1.0;

/// Bounded command handed to the actuator.
///
/// Only the smoother builds these from untrusted input, so every value is
/// within `STEER_RANGE` / `PEDAL_RANGE`.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ActionCommand {
    pub steer: f32,    // -1..1
    pub throttle: f32, // 0..1
    pub brake: f32,    // 0..1
    pub clutch: f32,   // 0..1
}

impl ActionCommand {
    pub const NEUTRAL: ActionCommand = ActionCommand { steer: 0.0, throttle: 0.0, brake: 0.0, clutch: 0.0 };

    pub fn is_within_bounds(&self) -> bool {
        STEER_RANGE.contains(&self.steer)
            && PEDAL_RANGE.contains(&self.throttle)
            && PEDAL_RANGE.contains(&self.brake)
            && PEDAL_RANGE.contains(&self.clutch)
    }
}

/// One scheduled boundary of the control loop.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct TickRecord {
    pub sequence: u64,
    /// When the tick fired, measured from the generator's clock origin.
    pub wall_time: Duration,
    pub target_interval: Duration,
    /// Time since the previous tick (or since the anchor for the first one).
    pub actual_interval: Duration,
    /// How late the tick fired relative to its anchored target.
    pub drift: Duration,
}

impl TickRecord {
    pub fn overran(&self, tolerance: f64) -> bool {
        self.actual_interval.as_secs_f64() > self.target_interval.as_secs_f64() * (1.0 + tolerance)
    }
}
