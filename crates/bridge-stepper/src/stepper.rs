use crate::config::BridgeConfig;
use bridge_control::{ActionSmoother, SmootherStats};
use bridge_core::{
    ActionCommand, Actuator, BridgeError, BridgeResult, MonotonicClock, RawAction, SessionControl, Shutdown,
    TelemetryFrame, TickRecord, WaitOutcome,
};
use bridge_telemetry::{TelemetryCache, WaitError};
use bridge_timing::{TickError, TickGenerator, TickStats};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepperState {
    /// No observation has been read yet.
    Uninitialized,
    Ready,
    Stepping,
    Resetting,
}

/// Metadata attached to every observation.
#[derive(Debug, Clone, Serialize)]
pub struct StepInfo {
    /// Tick that ended the step; None for the observation returned by reset.
    pub tick: Option<TickRecord>,
    pub step_count: u64,
    pub episode_id: Uuid,
    pub raw_action: Option<RawAction>,
    pub command: Option<ActionCommand>,
    /// Age of the frame when it was read.
    pub frame_age: Duration,
    pub stale: bool,
    pub episode_reset: bool,
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub observation: Arc<TelemetryFrame>,
    pub info: StepInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepperStats {
    pub state: StepperState,
    pub step_count: u64,
    pub control_hz: f64,
    pub episode_id: Uuid,
    pub tick: TickStats,
    pub smoother: SmootherStats,
    pub last_command: Option<ActionCommand>,
}

/// Drives one RL step at a time: smooth, actuate, wait for the next tick,
/// read the cache.
///
/// The command reaches the actuator before the tick wait begins, so the
/// observation read afterwards covers at least one full tick with that
/// command in effect. Taking `&mut self` keeps the actuator and smoother to
/// a single writer.
pub struct RealTimeStepper {
    cache: Arc<TelemetryCache>,
    ticker: TickGenerator,
    smoother: ActionSmoother,
    actuator: Box<dyn Actuator>,
    session: Box<dyn SessionControl>,
    clock: MonotonicClock,
    shutdown: Shutdown,
    settle_time: Duration,
    reset_frame_timeout: Duration,
    stale_after: Duration,
    initial_gear: Option<i8>,
    state: StepperState,
    step_count: u64,
    episode_id: Uuid,
    last_command: Option<ActionCommand>,
}

impl RealTimeStepper {
    pub fn new(
        config: &BridgeConfig,
        cache: Arc<TelemetryCache>,
        clock: MonotonicClock,
        shutdown: Shutdown,
        actuator: Box<dyn Actuator>,
        session: Box<dyn SessionControl>,
    ) -> BridgeResult<Self> {
        config.validate()?;
        let ticker = TickGenerator::start(config.control_hz, clock, shutdown.clone())?
            .with_overrun_tolerance(config.overrun_tolerance);
        let smoother = ActionSmoother::new(config.smoothing())?;
        info!(control_hz = config.control_hz, dt_ms = 1000.0 / config.control_hz, "stepper initialized");
        Ok(Self {
            cache,
            ticker,
            smoother,
            actuator,
            session,
            clock,
            shutdown,
            settle_time: config.settle_time(),
            reset_frame_timeout: config.first_frame_timeout(),
            stale_after: config.stale_after(),
            initial_gear: config.initial_gear,
            state: StepperState::Uninitialized,
            step_count: 0,
            episode_id: Uuid::new_v4(),
            last_command: None,
        })
    }

    pub fn state(&self) -> StepperState {
        self.state
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn episode_id(&self) -> Uuid {
        self.episode_id
    }

    pub fn smoother_mut(&mut self) -> &mut ActionSmoother {
        &mut self.smoother
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Latest observation without stepping.
    pub fn observe(&mut self) -> BridgeResult<StepResult> {
        let frame = self.cache.read()?;
        if self.state == StepperState::Uninitialized {
            self.state = StepperState::Ready;
        }
        Ok(self.result(frame, None, None, None, false))
    }

    /// `[steer, throttle, brake]` or `[steer, throttle, brake, clutch]`.
    pub fn step_slice(&mut self, action: &[f32]) -> BridgeResult<StepResult> {
        let raw = RawAction::from_slice(action).map_err(BridgeError::InvalidAction)?;
        self.step(raw)
    }

    pub fn step(&mut self, raw: RawAction) -> BridgeResult<StepResult> {
        let resume = self.enter(StepperState::Stepping)?;
        let res = self.step_inner(raw);
        self.leave(resume, res.is_ok());
        res
    }

    fn step_inner(&mut self, raw: RawAction) -> BridgeResult<StepResult> {
        if self.shutdown.is_triggered() {
            return Err(BridgeError::ShutDown);
        }
        if !raw.is_in_range() {
            debug!(?raw, "action out of range; clamping");
        }

        let command = self.smoother.filter(&raw);
        if let Err(e) = self.actuator.apply(&command) {
            warn!(error = %e, "actuator write failed; continuing with next tick");
        }
        self.last_command = Some(command);

        let tick = match self.ticker.next() {
            Ok(t) => t,
            Err(TickError::Interrupted) => {
                self.neutralise();
                return Err(BridgeError::ShutDown);
            }
        };

        let frame = self.cache.read()?;
        let res = self.result(frame, Some(tick), Some(raw), Some(command), false);
        if res.info.stale {
            debug!(
                sequence = res.observation.sequence,
                age_ms = res.info.frame_age.as_secs_f64() * 1000.0,
                "observation is stale"
            );
        }
        self.step_count += 1;
        Ok(res)
    }

    /// Restart the session and return the first observation of the new episode.
    pub fn reset(&mut self) -> BridgeResult<StepResult> {
        let resume = self.enter(StepperState::Resetting)?;
        let res = self.reset_inner();
        self.leave(resume, res.is_ok());
        res
    }

    fn reset_inner(&mut self) -> BridgeResult<StepResult> {
        if self.shutdown.is_triggered() {
            return Err(BridgeError::ShutDown);
        }
        let sequence_at_start = self.cache.latest_sequence();
        info!(episode = %self.episode_id, steps = self.step_count, "episode reset requested");

        self.session.trigger().map_err(|e| match e {
            BridgeError::ResetFailed(_) => e,
            other => BridgeError::ResetFailed(other.to_string()),
        })?;
        debug!(settle_ms = self.settle_time.as_millis() as u64, "session restart triggered");

        if self.shutdown.wait_until(self.clock.now() + self.settle_time) == WaitOutcome::Triggered {
            self.neutralise();
            return Err(BridgeError::ShutDown);
        }

        if let Err(e) = self.actuator.reset_to_neutral() {
            warn!(error = %e, "failed to neutralise controls after reset");
        }
        if let Some(gear) = self.initial_gear {
            if let Err(e) = self.actuator.select_gear(gear) {
                warn!(error = %e, gear, "failed to select initial gear");
            }
        }

        self.smoother.reset();
        self.ticker.reset(0);
        self.step_count = 0;
        self.last_command = None;
        self.episode_id = Uuid::new_v4();

        let frame = match self.cache.wait_newer_than(sequence_at_start, self.reset_frame_timeout, &self.shutdown) {
            Ok(frame) => frame,
            Err(WaitError::Interrupted) => {
                self.neutralise();
                return Err(BridgeError::ShutDown);
            }
            Err(e) => return Err(e.into()),
        };
        if sequence_at_start.is_some_and(|s| frame.sequence <= s) {
            warn!(sequence = frame.sequence, "no telemetry since reset began; initial observation predates it");
        }
        info!(episode = %self.episode_id, sequence = frame.sequence, "episode reset complete");
        Ok(self.result(frame, None, None, None, true))
    }

    fn enter(&mut self, next: StepperState) -> BridgeResult<StepperState> {
        match self.state {
            StepperState::Stepping | StepperState::Resetting => Err(BridgeError::Other(anyhow::anyhow!(
                "stepper is busy ({:?})",
                self.state
            ))),
            resume => {
                self.state = next;
                Ok(resume)
            }
        }
    }

    fn leave(&mut self, resume: StepperState, ok: bool) {
        self.state = if ok { StepperState::Ready } else { resume };
    }

    fn result(
        &self,
        frame: Arc<TelemetryFrame>,
        tick: Option<TickRecord>,
        raw_action: Option<RawAction>,
        command: Option<ActionCommand>,
        episode_reset: bool,
    ) -> StepResult {
        let frame_age = frame.age(self.clock.elapsed());
        StepResult {
            info: StepInfo {
                tick,
                step_count: self.step_count,
                episode_id: self.episode_id,
                raw_action,
                command,
                frame_age,
                stale: frame_age > self.stale_after,
                episode_reset,
            },
            observation: frame,
        }
    }

    /// Put the controls in a safe state after an interrupted wait.
    pub(crate) fn neutralise(&mut self) {
        if let Err(e) = self.actuator.reset_to_neutral() {
            warn!(error = %e, "failed to neutralise controls");
        }
        self.smoother.reset();
        self.last_command = None;
    }

    pub fn stats(&self) -> StepperStats {
        StepperStats {
            state: self.state,
            step_count: self.step_count,
            control_hz: self.ticker.frequency_hz(),
            episode_id: self.episode_id,
            tick: self.ticker.stats(),
            smoother: self.smoother.stats(),
            last_command: self.last_command,
        }
    }
}
