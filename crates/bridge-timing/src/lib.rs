//! Anchored tick generator for the fixed-rate control loop.
//!
//! Tick targets are always computed from the anchor `T0` as
//! `T0 + slot * period`, never by summing sleeps, so per-tick sleep overshoot
//! does not accumulate over long runs.

use bridge_core::{BridgeError, MonotonicClock, Shutdown, TickRecord, WaitOutcome};
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default fraction of the period by which an interval may exceed the target
/// before the tick counts as an overrun.
pub const DEFAULT_OVERRUN_TOLERANCE: f64 = 0.2;

/// Accumulated drift above this logs a warning.
const DRIFT_WARN_THRESHOLD: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TickError {
    #[error("tick wait interrupted by shutdown")]
    Interrupted,
}

impl From<TickError> for BridgeError {
    fn from(_: TickError) -> Self {
        BridgeError::ShutDown
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TickStats {
    pub frequency_hz: f64,
    pub target_interval: Duration,
    pub ticks: u64,
    pub elapsed: Duration,
    /// Ticks the schedule would have produced in `elapsed`.
    pub expected_ticks: u64,
    pub tick_deficit: i64,
    /// Mean lateness of ticks relative to their anchored targets.
    pub avg_drift: Duration,
    pub max_drift: Duration,
    pub overruns: u64,
    /// Grid slots passed over because the consumer fell more than a period behind.
    pub skipped_slots: u64,
    /// Sum of `actual_interval - target_interval` over all ticks, in milliseconds.
    pub total_drift_ms: f64,
    pub max_jitter: Duration,
}

#[derive(Debug, Default, Clone)]
struct Accum {
    ticks: u64,
    total_lateness: Duration,
    max_lateness: Duration,
    overruns: u64,
    skipped_slots: u64,
    total_interval_drift: f64,
    max_jitter: Duration,
    drift_warned: bool,
}

pub struct TickGenerator {
    frequency_hz: f64,
    period: Duration,
    overrun_tolerance: f64,
    clock: MonotonicClock,
    shutdown: Shutdown,
    anchor: Instant,
    /// Grid index of the last tick emitted since the anchor.
    slot: u64,
    sequence: u64,
    last_tick: Instant,
    acc: Accum,
}

impl TickGenerator {
    /// Anchor a new schedule at the current time. Fails fast on a
    /// non-positive or non-finite frequency.
    pub fn start(frequency_hz: f64, clock: MonotonicClock, shutdown: Shutdown) -> Result<Self, BridgeError> {
        if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
            return Err(BridgeError::Configuration(format!(
                "tick frequency must be positive, got {frequency_hz}"
            )));
        }
        let period = Duration::from_secs_f64(1.0 / frequency_hz);
        let now = clock.now();
        info!(hz = frequency_hz, period_ms = period.as_secs_f64() * 1000.0, "tick generator started");
        Ok(Self {
            frequency_hz,
            period,
            overrun_tolerance: DEFAULT_OVERRUN_TOLERANCE,
            clock,
            shutdown,
            anchor: now,
            slot: 0,
            sequence: 0,
            last_tick: now,
            acc: Accum::default(),
        })
    }

    pub fn with_overrun_tolerance(mut self, tolerance: f64) -> Self {
        if tolerance.is_finite() && tolerance >= 0.0 {
            self.overrun_tolerance = tolerance;
        }
        self
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sequence number the next tick will carry.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn slot_target(&self, slot: u64) -> Instant {
        self.anchor + Duration::from_secs_f64(slot as f64 / self.frequency_hz)
    }

    /// Block until the next scheduled boundary and return its record.
    ///
    /// A caller that is already past the target gets the tick immediately,
    /// with `actual_interval` above the period. If it fell more than a whole
    /// period behind, the missed grid slots are skipped rather than replayed,
    /// so the following tick lands on the next future slot of the anchored grid.
    pub fn next(&mut self) -> Result<TickRecord, TickError> {
        let due_slot = self.slot + 1;
        let target = self.slot_target(due_slot);

        if self.shutdown.wait_until(target) == WaitOutcome::Triggered {
            debug!(sequence = self.sequence, "tick wait interrupted");
            return Err(TickError::Interrupted);
        }

        let fired = self.clock.now();
        let actual_interval = fired.saturating_duration_since(self.last_tick);
        let lateness = fired.saturating_duration_since(target);

        let behind = (fired.saturating_duration_since(self.anchor).as_secs_f64() * self.frequency_hz).floor() as u64;
        self.slot = due_slot.max(behind);
        self.acc.skipped_slots += self.slot - due_slot;

        let record = TickRecord {
            sequence: self.sequence,
            wall_time: self.clock.since_origin(fired),
            target_interval: self.period,
            actual_interval,
            drift: lateness,
        };
        self.record(&record);

        self.last_tick = fired;
        self.sequence += 1;
        Ok(record)
    }

    fn record(&mut self, tick: &TickRecord) {
        let acc = &mut self.acc;
        acc.ticks += 1;
        acc.total_lateness += tick.drift;
        acc.max_lateness = acc.max_lateness.max(tick.drift);

        let jitter = if tick.actual_interval > self.period {
            tick.actual_interval - self.period
        } else {
            self.period - tick.actual_interval
        };
        acc.max_jitter = acc.max_jitter.max(jitter);
        acc.total_interval_drift += tick.actual_interval.as_secs_f64() - self.period.as_secs_f64();

        if tick.overran(self.overrun_tolerance) {
            acc.overruns += 1;
            debug!(
                sequence = tick.sequence,
                actual_ms = tick.actual_interval.as_secs_f64() * 1000.0,
                target_ms = self.period.as_secs_f64() * 1000.0,
                "tick overrun"
            );
        }

        let drifting = acc.total_interval_drift.abs() > DRIFT_WARN_THRESHOLD.as_secs_f64();
        if drifting && !acc.drift_warned {
            warn!(
                total_drift_ms = acc.total_interval_drift * 1000.0,
                max_jitter_ms = acc.max_jitter.as_secs_f64() * 1000.0,
                sequence = tick.sequence,
                "tick drift above threshold"
            );
        }
        acc.drift_warned = drifting;
    }

    /// Re-anchor `T0` at the current time with a fresh sequence and cleared
    /// statistics, so drift from a previous episode never carries over.
    pub fn reset(&mut self, start_sequence: u64) {
        let now = self.clock.now();
        self.anchor = now;
        self.last_tick = now;
        self.slot = 0;
        self.sequence = start_sequence;
        self.acc = Accum::default();
        info!(start_sequence, "tick generator reset");
    }

    pub fn stats(&self) -> TickStats {
        let elapsed = self.clock.now().saturating_duration_since(self.anchor);
        let expected_ticks = (elapsed.as_secs_f64() * self.frequency_hz) as u64;
        let acc = &self.acc;
        let avg_drift = if acc.ticks == 0 {
            Duration::ZERO
        } else {
            acc.total_lateness / acc.ticks.min(u32::MAX as u64) as u32
        };
        TickStats {
            frequency_hz: self.frequency_hz,
            target_interval: self.period,
            ticks: acc.ticks,
            elapsed,
            expected_ticks,
            tick_deficit: expected_ticks as i64 - acc.ticks as i64,
            avg_drift,
            max_drift: acc.max_lateness,
            overruns: acc.overruns,
            skipped_slots: acc.skipped_slots,
            total_drift_ms: acc.total_interval_drift * 1000.0,
            max_jitter: acc.max_jitter,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn generator(hz: f64) -> TickGenerator {
        TickGenerator::start(hz, MonotonicClock::new(), Shutdown::new()).unwrap()
    }

    /// Deterministic stand-in for variable per-tick work, 0..max_ms.
    fn synthetic_work(i: u64, max_ms: u64) -> Duration {
        Duration::from_millis((i * 37 + 11) % (max_ms + 1))
    }

    #[test]
    fn test_rejects_invalid_frequency() {
        for hz in [0.0, -10.0, f64::NAN, f64::INFINITY] {
            let res = TickGenerator::start(hz, MonotonicClock::new(), Shutdown::new());
            assert!(matches!(res, Err(BridgeError::Configuration(_))), "hz={hz}");
        }
    }

    #[test]
    fn test_elapsed_converges_despite_variable_work() {
        let start = Instant::now();
        let mut ticker = generator(100.0);
        for i in 0..50 {
            thread::sleep(synthetic_work(i, 5));
            let t = ticker.next().unwrap();
            assert_eq!(t.sequence, i);
            assert_eq!(t.target_interval, Duration::from_millis(10));
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(520), "{elapsed:?}");
        let stats = ticker.stats();
        assert_eq!(stats.ticks, 50);
        assert_eq!(stats.overruns, 0);
        assert_eq!(stats.skipped_slots, 0);
    }

    #[test]
    #[ignore = "runs for ten seconds of wall time"]
    fn test_ten_hz_hundred_ticks_with_heavy_work() {
        const HZ: f64 = 10.0;
        const TICKS: u64 = 100;
        let start = Instant::now();
        let mut ticker = generator(HZ);
        for i in 0..TICKS {
            thread::sleep(synthetic_work(i, 50));
            ticker.next().unwrap();
        }
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        let expected = TICKS as f64 / HZ * 1000.0;
        assert!((elapsed - expected).abs() <= 10.0, "elapsed {elapsed}ms, expected {expected}ms");
    }

    #[test]
    fn test_late_consumer_gets_immediate_tick_and_overrun() {
        let mut ticker = generator(50.0); // 20ms
        ticker.next().unwrap();
        thread::sleep(Duration::from_millis(55));
        let before = Instant::now();
        let late = ticker.next().unwrap();
        assert!(before.elapsed() < Duration::from_millis(5));
        assert!(late.actual_interval > late.target_interval);
        assert!(late.drift >= Duration::from_millis(10));

        // the next tick is back on the anchored grid, not a burst
        let on_grid = ticker.next().unwrap();
        assert!(on_grid.drift < Duration::from_millis(5), "{:?}", on_grid.drift);
        assert!(on_grid.actual_interval < on_grid.target_interval);

        let stats = ticker.stats();
        assert_eq!(stats.overruns, 1);
        assert!(stats.skipped_slots >= 1);
        assert_eq!(stats.ticks, 3);
    }

    #[test]
    fn test_reset_reanchors_and_clears_stats() {
        let mut ticker = generator(100.0);
        ticker.next().unwrap();
        thread::sleep(Duration::from_millis(40));
        ticker.next().unwrap();
        assert_eq!(ticker.stats().overruns, 1);

        ticker.reset(0);
        assert_eq!(ticker.stats().ticks, 0);
        let t = ticker.next().unwrap();
        assert_eq!(t.sequence, 0);
        assert!(t.actual_interval >= Duration::from_millis(10));
        assert!(t.drift < Duration::from_millis(5), "{:?}", t.drift);
        assert_eq!(ticker.stats().overruns, 0);
    }

    #[test]
    fn test_shutdown_interrupts_wait_without_advancing() {
        let shutdown = Shutdown::new();
        let mut ticker = TickGenerator::start(0.5, MonotonicClock::new(), shutdown.clone()).unwrap();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            shutdown.trigger();
        });
        let start = Instant::now();
        assert_eq!(ticker.next(), Err(TickError::Interrupted));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(ticker.sequence(), 0);
        assert_eq!(ticker.stats().ticks, 0);
        trigger.join().unwrap();
    }
}
