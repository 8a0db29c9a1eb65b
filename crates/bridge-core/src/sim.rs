//! In-process stand-ins for the external collaborators. Used by tests and
//! for dry runs without a simulator attached.

use crate::{ActionCommand, Actuator, BridgeError, BridgeResult, NamedFields, SessionControl, TelemetrySource};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Synthetic telemetry: a packet counter plus a few driving fields derived from it.
#[derive(Default)]
pub struct SimulatedSource {
    reads: AtomicU64,
    fail_next: AtomicU32,
    hang: Mutex<Option<Duration>>,
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` reads fail with `SourceUnavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Make every read block for `d` before returning (None clears it).
    pub fn hang_for(&self, d: Option<Duration>) {
        *self.hang.lock() = d;
    }

    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }
}

impl TelemetrySource for SimulatedSource {
    fn snapshot(&self) -> BridgeResult<NamedFields> {
        let hang = *self.hang.lock();
        if let Some(d) = hang {
            std::thread::sleep(d);
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(BridgeError::SourceUnavailable("simulated read failure".into()));
        }

        let packet = self.reads.fetch_add(1, Ordering::SeqCst);
        let t = packet as f64 * 0.1;
        let mut fields = NamedFields::new();
        fields.insert("packet_id".into(), (packet as i64).into());
        fields.insert("speed_kmh".into(), (100.0 + 20.0 * t.sin()).into());
        fields.insert("rpm".into(), (4000.0 + 500.0 * t.cos()).into());
        fields.insert("gear".into(), 3_i64.into());
        fields.insert("velocity".into(), vec![t.cos(), 0.0, t.sin()].into());
        fields.insert("is_in_pit_lane".into(), false.into());
        Ok(fields)
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[derive(Debug, Default)]
struct ActuatorLog {
    commands: Vec<ActionCommand>,
    neutral_resets: u32,
    gears: Vec<i8>,
    fail_next: u32,
}

/// Records every command it receives. Clones share the same log.
#[derive(Clone, Default)]
pub struct RecordingActuator {
    log: Arc<Mutex<ActuatorLog>>,
}

impl RecordingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: u32) {
        self.log.lock().fail_next = n;
    }

    pub fn commands(&self) -> Vec<ActionCommand> {
        self.log.lock().commands.clone()
    }

    pub fn last(&self) -> Option<ActionCommand> {
        self.log.lock().commands.last().copied()
    }

    pub fn neutral_resets(&self) -> u32 {
        self.log.lock().neutral_resets
    }

    pub fn gears(&self) -> Vec<i8> {
        self.log.lock().gears.clone()
    }
}

impl Actuator for RecordingActuator {
    fn apply(&mut self, command: &ActionCommand) -> BridgeResult<()> {
        let mut log = self.log.lock();
        if log.fail_next > 0 {
            log.fail_next -= 1;
            return Err(BridgeError::ActuatorFault("simulated device write failure".into()));
        }
        log.commands.push(*command);
        Ok(())
    }

    fn reset_to_neutral(&mut self) -> BridgeResult<()> {
        let mut log = self.log.lock();
        log.neutral_resets += 1;
        log.commands.push(ActionCommand::NEUTRAL);
        Ok(())
    }

    fn select_gear(&mut self, gear: i8) -> BridgeResult<()> {
        self.log.lock().gears.push(gear);
        Ok(())
    }
}

/// Session restart that succeeds unless told otherwise.
#[derive(Clone, Default)]
pub struct ScriptedSession {
    triggers: Arc<AtomicU32>,
    fail: Arc<AtomicBool>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn triggers(&self) -> u32 {
        self.triggers.load(Ordering::SeqCst)
    }
}

impl SessionControl for ScriptedSession {
    fn trigger(&mut self) -> BridgeResult<()> {
        self.triggers.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(BridgeError::ResetFailed("restart not confirmed".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_failures_are_consumed() {
        let src = SimulatedSource::new();
        src.fail_next(2);
        assert!(matches!(src.snapshot(), Err(BridgeError::SourceUnavailable(_))));
        assert!(src.snapshot().is_err());
        let fields = src.snapshot().unwrap();
        assert_eq!(fields.get("packet_id").and_then(|v| v.as_f64()), Some(0.0));
        assert_eq!(src.reads(), 1);
    }

    #[test]
    fn test_actuator_clones_share_log() {
        let act = RecordingActuator::new();
        let mut handle: Box<dyn Actuator> = Box::new(act.clone());
        handle.apply(&ActionCommand { steer: 0.5, ..ActionCommand::NEUTRAL }).unwrap();
        act.fail_next(1);
        assert!(handle.apply(&ActionCommand::NEUTRAL).is_err());
        handle.select_gear(2).unwrap();
        assert_eq!(act.commands().len(), 1);
        assert_eq!(act.last().map(|c| c.steer), Some(0.5));
        assert_eq!(act.gears(), vec![2]);
    }
}
