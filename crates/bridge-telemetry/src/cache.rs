use bridge_core::{BridgeError, Shutdown, TelemetryFrame};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no telemetry frame has been published yet")]
pub struct NotReady;

impl From<NotReady> for BridgeError {
    fn from(_: NotReady) -> Self {
        BridgeError::ObservationUnavailable
    }
}

/// Why a blocking frame wait returned without a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("no telemetry frame has been published yet")]
    NotReady,
    #[error("frame wait interrupted by shutdown")]
    Interrupted,
}

impl From<WaitError> for BridgeError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::NotReady => BridgeError::ObservationUnavailable,
            WaitError::Interrupted => BridgeError::ShutDown,
        }
    }
}

/// Wakes frame waiters on publish and on shutdown.
#[derive(Default)]
struct Signal {
    lock: Mutex<()>,
    changed: Condvar,
}

impl Signal {
    fn notify(&self) {
        let _guard = self.lock.lock();
        self.changed.notify_all();
    }
}

#[derive(Default)]
struct Slot {
    frame: Option<Arc<TelemetryFrame>>,
    version: u64,
}

/// Holds the most recent complete telemetry frame.
///
/// One writer publishes fully built frames; the slot only ever swaps an
/// `Arc`, so a reader gets either the previous frame or the new one, never a
/// mix. Readers hold the read lock just long enough to clone the `Arc`.
#[derive(Default)]
pub struct TelemetryCache {
    slot: RwLock<Slot>,
    // mirrors slot.version for lock-free change detection
    version: AtomicU64,
    signal: Arc<Signal>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swap in a new frame and return the new version. A frame whose sequence
    /// is lower than the held one is dropped.
    pub fn publish(&self, frame: TelemetryFrame) -> u64 {
        let frame = Arc::new(frame);
        let (previous, version) = {
            let mut slot = self.slot.write();
            if let Some(held) = &slot.frame {
                if frame.sequence < held.sequence {
                    warn!(held = held.sequence, rejected = frame.sequence, "out-of-order frame dropped");
                    return slot.version;
                }
            }
            slot.version += 1;
            self.version.store(slot.version, Ordering::Release);
            (slot.frame.replace(frame), slot.version)
        };
        // the superseded frame is released outside the lock
        drop(previous);
        self.signal.notify();
        version
    }

    pub fn read(&self) -> Result<Arc<TelemetryFrame>, NotReady> {
        self.slot.read().frame.clone().ok_or(NotReady)
    }

    /// Frame together with the version it was published under.
    pub fn read_versioned(&self) -> Result<(u64, Arc<TelemetryFrame>), NotReady> {
        let slot = self.slot.read();
        slot.frame.clone().map(|f| (slot.version, f)).ok_or(NotReady)
    }

    /// Number of frames published so far.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn latest_sequence(&self) -> Option<u64> {
        self.slot.read().frame.as_ref().map(|f| f.sequence)
    }

    pub fn is_ready(&self) -> bool {
        self.version() > 0
    }

    /// Block until a first frame exists, `timeout` passes, or `stop` fires.
    pub fn wait_for_frame(&self, timeout: Duration, stop: &Shutdown) -> Result<Arc<TelemetryFrame>, WaitError> {
        self.wait_for(|_| true, timeout, stop)
    }

    /// Block until a frame newer than `sequence` is held, `timeout` passes,
    /// or `stop` fires. On timeout the latest frame is returned even if it is
    /// not newer; callers compare sequences to tell the two apart.
    pub fn wait_newer_than(
        &self,
        sequence: Option<u64>,
        timeout: Duration,
        stop: &Shutdown,
    ) -> Result<Arc<TelemetryFrame>, WaitError> {
        self.wait_for(|f| sequence.map_or(true, |s| f.sequence > s), timeout, stop)
    }

    fn wait_for(
        &self,
        accept: impl Fn(&TelemetryFrame) -> bool,
        timeout: Duration,
        stop: &Shutdown,
    ) -> Result<Arc<TelemetryFrame>, WaitError> {
        let deadline = Instant::now() + timeout;
        let _wake = {
            let signal = Arc::clone(&self.signal);
            stop.on_trigger(move || signal.notify())
        };
        // publish and the shutdown waker both notify under this lock, so a
        // change between the checks below and the wait is never missed
        let mut guard = self.signal.lock.lock();
        loop {
            if stop.is_triggered() {
                return Err(WaitError::Interrupted);
            }
            if let Ok(frame) = self.read() {
                if accept(&frame) {
                    return Ok(frame);
                }
            }
            if self.signal.changed.wait_until(&mut guard, deadline).timed_out() {
                if stop.is_triggered() {
                    return Err(WaitError::Interrupted);
                }
                return self.read().map_err(|_| WaitError::NotReady);
            }
        }
    }
}
