use anyhow::{bail, Context, Result};
use bytes::Bytes;
use model::{ActionCommand, TelemetryFrame, TickRecord};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Telemetry,
    TelemetryBatch,
    Control,
    ControlBatch,
    /// Experience streamed from an actor to a learner.
    Transition,
    TransitionBatch,
    Ping,
    Pong,
    Error,
}

/// Envelope for everything sent to or received from a remote consumer.
/// The payload stays untyped until the receiver asks for it by kind.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub payload: Value,
    /// Seconds on the bridge clock; None for messages not tied to a frame.
    pub timestamp: Option<f64>,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TelemetryPayload {
    pub frame: TelemetryFrame,
    pub tick: Option<TickRecord>,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct ControlPayload {
    pub seq: u64,
    pub steer: f32,
    pub throttle: f32,
    pub brake: f32,
    #[serde(default)]
    pub clutch: f32,
    #[serde(default)]
    pub gear: Option<i8>,
}

impl ControlPayload {
    pub fn new(seq: u64, command: &ActionCommand) -> Self {
        Self {
            seq,
            steer: command.steer,
            throttle: command.throttle,
            brake: command.brake,
            clutch: command.clutch,
            gear: None,
        }
    }

    pub fn command(&self) -> ActionCommand {
        ActionCommand { steer: self.steer, throttle: self.throttle, brake: self.brake, clutch: self.clutch }
    }
}

/// One `(obs, action, reward, next_obs, done)` step.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct TransitionPayload {
    pub seq: u64,
    pub obs: Vec<f32>,
    pub action: Vec<f32>,
    pub reward: f64,
    pub next_obs: Vec<f32>,
    pub done: bool,
    #[serde(default)]
    pub info: Value,
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ErrorPayload {
    pub error: String,
    #[serde(default)]
    pub details: Value,
}

impl Message {
    fn new(kind: MessageKind, payload: Value, timestamp: Option<f64>) -> Self {
        Self { kind, payload, timestamp }
    }

    pub fn telemetry(frame: &TelemetryFrame, tick: Option<TickRecord>) -> Result<Self> {
        let payload = serde_json::to_value(TelemetryPayload { frame: frame.clone(), tick })?;
        Ok(Self::new(MessageKind::Telemetry, payload, Some(frame.captured_at.as_secs_f64())))
    }

    pub fn telemetry_batch(frames: &[TelemetryFrame]) -> Result<Self> {
        let payload = serde_json::to_value(frames)?;
        let timestamp = frames.last().map(|f| f.captured_at.as_secs_f64());
        Ok(Self::new(MessageKind::TelemetryBatch, payload, timestamp))
    }

    pub fn control(seq: u64, command: &ActionCommand) -> Result<Self> {
        let payload = serde_json::to_value(ControlPayload::new(seq, command))?;
        Ok(Self::new(MessageKind::Control, payload, None))
    }

    pub fn control_batch(commands: &[ControlPayload]) -> Result<Self> {
        Ok(Self::new(MessageKind::ControlBatch, serde_json::to_value(commands)?, None))
    }

    pub fn transition(transition: &TransitionPayload) -> Result<Self> {
        Ok(Self::new(MessageKind::Transition, serde_json::to_value(transition)?, None))
    }

    pub fn transition_batch(transitions: &[TransitionPayload]) -> Result<Self> {
        Ok(Self::new(MessageKind::TransitionBatch, serde_json::to_value(transitions)?, None))
    }

    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, Value::Object(Default::default()), None)
    }

    pub fn pong() -> Self {
        Self::new(MessageKind::Pong, Value::Object(Default::default()), None)
    }

    pub fn error(text: impl Into<String>) -> Self {
        let payload = serde_json::json!({ "error": text.into(), "details": {} });
        Self::new(MessageKind::Error, payload, None)
    }

    fn payload_as<T: DeserializeOwned>(&self, expected: MessageKind) -> Result<T> {
        if self.kind != expected {
            bail!("expected {expected:?} message, got {:?}", self.kind);
        }
        serde_json::from_value(self.payload.clone()).with_context(|| format!("malformed {expected:?} payload"))
    }

    pub fn as_telemetry(&self) -> Result<TelemetryPayload> {
        self.payload_as(MessageKind::Telemetry)
    }

    pub fn as_telemetry_batch(&self) -> Result<Vec<TelemetryFrame>> {
        self.payload_as(MessageKind::TelemetryBatch)
    }

    pub fn as_control(&self) -> Result<ControlPayload> {
        self.payload_as(MessageKind::Control)
    }

    pub fn as_control_batch(&self) -> Result<Vec<ControlPayload>> {
        self.payload_as(MessageKind::ControlBatch)
    }

    pub fn as_transition(&self) -> Result<TransitionPayload> {
        self.payload_as(MessageKind::Transition)
    }

    pub fn as_transition_batch(&self) -> Result<Vec<TransitionPayload>> {
        self.payload_as(MessageKind::TransitionBatch)
    }

    pub fn as_error(&self) -> Result<ErrorPayload> {
        self.payload_as(MessageKind::Error)
    }
}

/// Wire encoding. JSON for debugging, MessagePack for throughput.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    #[default]
    Json,
    #[serde(rename = "msgpack")]
    MessagePack,
}

impl Codec {
    pub fn encode(self, msg: &Message) -> Result<Bytes> {
        let buf = match self {
            Codec::Json => serde_json::to_vec(msg)?,
            // named so the map keys survive for non-Rust consumers
            Codec::MessagePack => rmp_serde::to_vec_named(msg)?,
        };
        Ok(Bytes::from(buf))
    }

    pub fn decode(self, data: &[u8]) -> Result<Message> {
        let msg = match self {
            Codec::Json => serde_json::from_slice(data).context("decode json message")?,
            Codec::MessagePack => rmp_serde::from_slice(data).context("decode msgpack message")?,
        };
        Ok(msg)
    }
}

impl FromStr for Codec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Codec::Json),
            "msgpack" | "messagepack" => Ok(Codec::MessagePack),
            other => bail!("unknown codec {other:?}"),
        }
    }
}

/// Groups frames into `TelemetryBatch` messages to cut per-message
/// overhead for remote consumers.
#[derive(Debug)]
pub struct FrameBatcher {
    max_frames: usize,
    frames: Vec<TelemetryFrame>,
}

impl FrameBatcher {
    pub fn new(max_frames: usize) -> Self {
        let max_frames = max_frames.max(1);
        Self { max_frames, frames: Vec::with_capacity(max_frames) }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Add a frame; returns a batch once `max_frames` are held.
    pub fn push(&mut self, frame: TelemetryFrame) -> Result<Option<Message>> {
        self.frames.push(frame);
        if self.frames.len() >= self.max_frames {
            return self.flush();
        }
        Ok(None)
    }

    /// Emit whatever is held, if anything.
    pub fn flush(&mut self) -> Result<Option<Message>> {
        if self.frames.is_empty() {
            return Ok(None);
        }
        let frames = std::mem::replace(&mut self.frames, Vec::with_capacity(self.max_frames));
        Message::telemetry_batch(&frames).map(Some)
    }
}
