//! Real-time stepping for RL training: apply an action, wait one control
//! tick, observe.
//!
//! ```no_run
//! use std::sync::Arc;
//! use bridge_core::sim::{RecordingActuator, ScriptedSession, SimulatedSource};
//! use bridge_core::RawAction;
//! use bridge_stepper::{Bridge, BridgeConfig};
//!
//! # fn main() -> Result<(), bridge_core::BridgeError> {
//! let mut bridge = Bridge::connect(
//!     BridgeConfig::default(),
//!     Arc::new(SimulatedSource::new()),
//!     Box::new(RecordingActuator::new()),
//!     Box::new(ScriptedSession::new()),
//! )?;
//! let first = bridge.reset()?;
//! let next = bridge.step(RawAction::new(0.1, 0.5, 0.0))?;
//! assert!(next.observation.sequence >= first.observation.sequence);
//! bridge.close();
//! # Ok(())
//! # }
//! ```

mod bridge;
mod config;
mod stepper;

pub use bridge::Bridge;
pub use config::BridgeConfig;
pub use stepper::{RealTimeStepper, StepInfo, StepResult, StepperState, StepperStats};
