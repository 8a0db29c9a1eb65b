use crate::cache::TelemetryCache;
use bridge_core::{BridgeError, BridgeResult, MonotonicClock, NamedFields, Shutdown, TelemetryFrame, TelemetrySource};
use crossbeam_channel::RecvTimeoutError;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct PollerStats {
    pub published: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PollerStats {
        PollerStats {
            published: self.published.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

/// Pulls snapshots from the telemetry source and publishes them as frames.
///
/// Pacing is a plain sleep of one period after each read. This loop only
/// keeps the cache fresh; it is not on the causal path of a control step and
/// does not need an anchored schedule.
pub struct BackgroundPoller {
    source: Arc<dyn TelemetrySource>,
    cache: Arc<TelemetryCache>,
    clock: MonotonicClock,
    period: Duration,
    source_timeout: Duration,
    counters: Arc<Counters>,
}

impl BackgroundPoller {
    pub fn new(
        source: Arc<dyn TelemetrySource>,
        cache: Arc<TelemetryCache>,
        clock: MonotonicClock,
        hz: f64,
        source_timeout: Duration,
    ) -> BridgeResult<Self> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(BridgeError::Configuration(format!("telemetry rate must be positive, got {hz}")));
        }
        if source_timeout.is_zero() {
            return Err(BridgeError::Configuration("source timeout must be non-zero".into()));
        }
        Ok(Self {
            source,
            cache,
            clock,
            period: Duration::from_secs_f64(1.0 / hz),
            source_timeout,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Start the loop on `handle`. The loop exits once `stop` is triggered.
    pub fn spawn(self, handle: &Handle, stop: Shutdown) -> PollerHandle {
        let counters = Arc::clone(&self.counters);
        let period = self.period;
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(0);
        let task = handle.spawn({
            let stop = stop.clone();
            async move {
                self.run(stop).await;
                drop(done_tx);
            }
        });
        PollerHandle { stop, task, done: done_rx, counters, period }
    }

    /// Poll until `stop` is triggered. A read that hangs past the source
    /// timeout counts as a failure and is awaited again on the next iteration
    /// instead of stacking another blocking read behind it.
    pub async fn run(self, stop: Shutdown) {
        info!(
            source = self.source.name(),
            hz = 1.0 / self.period.as_secs_f64(),
            "telemetry poller started"
        );
        let started = self.clock.now();
        let mut sequence = self.cache.latest_sequence().map_or(0, |s| s + 1);
        let mut last_success: Option<Instant> = None;
        let mut pending: Option<JoinHandle<BridgeResult<NamedFields>>> = None;

        loop {
            if stop.is_triggered() {
                break;
            }
            let mut read = match pending.take() {
                Some(read) => read,
                None => {
                    let source = Arc::clone(&self.source);
                    tokio::task::spawn_blocking(move || source.snapshot())
                }
            };

            let outcome = tokio::select! {
                _ = stop.triggered() => break,
                res = tokio::time::timeout(self.source_timeout, &mut read) => res,
            };

            match outcome {
                Ok(Ok(Ok(fields))) => {
                    let now = self.clock.now();
                    let actual_interval = now.saturating_duration_since(last_success.unwrap_or(started));
                    let frame = TelemetryFrame {
                        sequence,
                        captured_at: self.clock.since_origin(now),
                        target_interval: self.period,
                        actual_interval,
                        fields,
                    };
                    self.cache.publish(frame);
                    if last_success.is_none() {
                        info!(sequence, "first telemetry frame published");
                    }
                    let streak = self.counters.consecutive_failures.swap(0, Ordering::Relaxed);
                    if streak > 0 {
                        info!(failed_reads = streak, "telemetry source recovered");
                    }
                    self.counters.published.fetch_add(1, Ordering::Relaxed);
                    last_success = Some(now);
                    sequence += 1;
                }
                Ok(Ok(Err(e))) => self.record_failure(&e.to_string()),
                Ok(Err(join)) => {
                    error!(error = %join, "telemetry read task failed");
                    self.record_failure("read task failed");
                }
                Err(_) => {
                    pending = Some(read);
                    self.record_failure("read timed out");
                }
            }

            tokio::select! {
                _ = stop.triggered() => break,
                _ = tokio::time::sleep(self.period) => {}
            }
        }

        let stats = self.counters.snapshot();
        info!(published = stats.published, failures = stats.failures, "telemetry poller stopped");
    }

    fn record_failure(&self, reason: &str) {
        self.counters.failures.fetch_add(1, Ordering::Relaxed);
        let streak = self.counters.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if streak == 1 {
            warn!(error = reason, "telemetry read failed; cached frame will go stale");
        } else {
            debug!(error = reason, streak, "telemetry read failed");
        }
    }
}

pub struct PollerHandle {
    stop: Shutdown,
    task: JoinHandle<()>,
    done: crossbeam_channel::Receiver<()>,
    counters: Arc<Counters>,
    period: Duration,
}

impl PollerHandle {
    pub fn stats(&self) -> PollerStats {
        self.counters.snapshot()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the loop to stop and wait until it has exited, at most one
    /// polling period plus `grace`. Returns false if the loop had not exited
    /// by then; the task is aborted in that case.
    pub fn stop(&self, grace: Duration) -> bool {
        self.stop.trigger();
        match self.done.recv_timeout(self.period + grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => {
                warn!("telemetry poller did not stop in time; aborting");
                self.task.abort();
                false
            }
        }
    }
}
