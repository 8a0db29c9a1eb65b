use crate::config::BridgeConfig;
use crate::stepper::{RealTimeStepper, StepResult, StepperStats};
use anyhow::Context;
use bridge_core::{
    Actuator, BridgeError, BridgeResult, MonotonicClock, RawAction, SessionControl, Shutdown, TelemetryFrame,
    TelemetrySource,
};
use bridge_telemetry::{BackgroundPoller, PollerHandle, PollerStats, TelemetryCache};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{info, warn};

const POLLER_STOP_GRACE: Duration = Duration::from_millis(500);

/// Owns the whole pipeline: the poller runtime, the cache and the stepper.
///
/// One `Shutdown` is shared by the poller loop and the tick wait, so
/// triggering it from any thread stops both.
pub struct Bridge {
    runtime: Option<Runtime>,
    poller: Option<PollerHandle>,
    cache: Arc<TelemetryCache>,
    stepper: RealTimeStepper,
    shutdown: Shutdown,
    closed: bool,
}

impl Bridge {
    /// Start polling `source` and wait up to `first_frame_timeout` for the
    /// first frame. A missing first frame is logged, not fatal; steps report
    /// `ObservationUnavailable` until telemetry arrives.
    pub fn connect(
        config: BridgeConfig,
        source: Arc<dyn TelemetrySource>,
        actuator: Box<dyn Actuator>,
        session: Box<dyn SessionControl>,
    ) -> BridgeResult<Self> {
        config.validate()?;
        let clock = MonotonicClock::new();
        let shutdown = Shutdown::new();
        let cache = Arc::new(TelemetryCache::new());
        let source_name = source.name().to_string();

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("telemetry-poller")
            .enable_time()
            .build()
            .context("build telemetry runtime")?;

        let poller = BackgroundPoller::new(
            source,
            Arc::clone(&cache),
            clock,
            config.telemetry_hz,
            config.source_timeout(),
        )?
        .spawn(runtime.handle(), shutdown.clone());

        match cache.wait_for_frame(config.first_frame_timeout(), &shutdown) {
            Ok(frame) => info!(
                source = %source_name,
                sequence = frame.sequence,
                started = %clock.format_wall_time(Duration::ZERO),
                "telemetry connected"
            ),
            Err(_) => warn!(
                source = %source_name,
                timeout_ms = config.first_frame_timeout_ms,
                "no telemetry within first-frame timeout; continuing"
            ),
        }

        let stepper = RealTimeStepper::new(&config, Arc::clone(&cache), clock, shutdown.clone(), actuator, session);
        let stepper = match stepper {
            Ok(s) => s,
            Err(e) => {
                poller.stop(POLLER_STOP_GRACE);
                runtime.shutdown_background();
                return Err(e);
            }
        };

        Ok(Self {
            runtime: Some(runtime),
            poller: Some(poller),
            cache,
            stepper,
            shutdown,
            closed: false,
        })
    }

    pub fn step(&mut self, action: RawAction) -> BridgeResult<StepResult> {
        self.ensure_open()?;
        self.stepper.step(action)
    }

    pub fn step_slice(&mut self, action: &[f32]) -> BridgeResult<StepResult> {
        self.ensure_open()?;
        self.stepper.step_slice(action)
    }

    pub fn reset(&mut self) -> BridgeResult<StepResult> {
        self.ensure_open()?;
        self.stepper.reset()
    }

    pub fn observe(&mut self) -> BridgeResult<StepResult> {
        self.ensure_open()?;
        self.stepper.observe()
    }

    pub fn latest(&self) -> Option<Arc<TelemetryFrame>> {
        self.cache.read().ok()
    }

    pub fn cache(&self) -> &Arc<TelemetryCache> {
        &self.cache
    }

    pub fn stepper_mut(&mut self) -> &mut RealTimeStepper {
        &mut self.stepper
    }

    /// True while the poller runs and no shutdown has been requested.
    pub fn is_connected(&self) -> bool {
        !self.closed && !self.shutdown.is_triggered() && self.poller.as_ref().is_some_and(|p| !p.is_finished())
    }

    pub fn poller_stats(&self) -> PollerStats {
        self.poller.as_ref().map(PollerHandle::stats).unwrap_or_default()
    }

    pub fn stats(&self) -> StepperStats {
        self.stepper.stats()
    }

    /// Clone of the shared stop signal, for interrupting a blocked step from
    /// another thread.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Stop the poller, neutralise the controls, and release the runtime.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.shutdown.trigger();
        if let Some(poller) = self.poller.take() {
            if !poller.stop(POLLER_STOP_GRACE) {
                warn!("telemetry poller was aborted during close");
            }
            let stats = poller.stats();
            info!(published = stats.published, failures = stats.failures, "telemetry poller stopped");
        }
        self.stepper.neutralise();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        info!(steps = self.stepper.step_count(), "bridge closed");
    }

    fn ensure_open(&self) -> BridgeResult<()> {
        if self.closed || self.shutdown.is_triggered() {
            return Err(BridgeError::ShutDown);
        }
        Ok(())
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.close();
    }
}
