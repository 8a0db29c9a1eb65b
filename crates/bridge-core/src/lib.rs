//! Core types and collaborator traits shared by the bridge crates

pub mod clock;
pub mod logging;
pub mod shutdown;
pub mod sim;

pub use clock::MonotonicClock;
pub use model::{ActionCommand, FieldValue, NamedFields, RawAction, TelemetryFrame, TickRecord};
pub use shutdown::{Shutdown, TriggerHook, WaitOutcome};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The telemetry source could not produce a snapshot.
    #[error("telemetry source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("actuator fault: {0}")]
    ActuatorFault(String),
    /// No frame has ever been published to the cache.
    #[error("no observation available; is the telemetry source running?")]
    ObservationUnavailable,
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("session reset failed: {0}")]
    ResetFailed(String),
    #[error("action must have at least 3 components, got {0}")]
    InvalidAction(usize),
    #[error("bridge is shutting down")]
    ShutDown,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BridgeResult<T> = Result<T, BridgeError>;

/// Synchronous snapshot reader for the external telemetry source
/// (shared memory, UDP cache, ...). Cross-field atomicity is not guaranteed.
pub trait TelemetrySource: Send + Sync + 'static {
    fn snapshot(&self) -> BridgeResult<NamedFields>;

    fn name(&self) -> &str {
        "telemetry"
    }
}

/// Converts commands into control inputs for the simulator.
pub trait Actuator: Send {
    fn apply(&mut self, command: &ActionCommand) -> BridgeResult<()>;

    fn reset_to_neutral(&mut self) -> BridgeResult<()>;

    /// Gear numbering follows the source: 0=R, 1=N, 2=first.
    fn select_gear(&mut self, _gear: i8) -> BridgeResult<()> {
        Ok(())
    }
}

/// Restarts the simulator session. Opaque beyond success/failure.
pub trait SessionControl: Send {
    fn trigger(&mut self) -> BridgeResult<()>;
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn apply(&mut self, command: &ActionCommand) -> BridgeResult<()> {
        (**self).apply(command)
    }
    fn reset_to_neutral(&mut self) -> BridgeResult<()> {
        (**self).reset_to_neutral()
    }
    fn select_gear(&mut self, gear: i8) -> BridgeResult<()> {
        (**self).select_gear(gear)
    }
}

impl<S: SessionControl + ?Sized> SessionControl for Box<S> {
    fn trigger(&mut self) -> BridgeResult<()> {
        (**self).trigger()
    }
}
