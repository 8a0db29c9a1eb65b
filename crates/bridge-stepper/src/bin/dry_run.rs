//! Runs one short episode against the simulated collaborators and records
//! the frames and tick timing. `BRIDGE_CONFIG` points at a JSON config,
//! `BRIDGE_RECORD_DIR` at the output directory (defaults to the temp dir).

use bridge_core::sim::{RecordingActuator, ScriptedSession, SimulatedSource};
use bridge_core::{logging, BridgeResult, RawAction};
use bridge_stepper::{Bridge, BridgeConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const STEPS: usize = 50;

fn main() -> BridgeResult<()> {
    logging::init("info");

    let config = match std::env::var_os("BRIDGE_CONFIG") {
        Some(path) => BridgeConfig::from_json_file(&PathBuf::from(path))?,
        None => BridgeConfig { settle_ms: 0, ..Default::default() },
    };
    let out_dir = std::env::var_os("BRIDGE_RECORD_DIR").map(PathBuf::from).unwrap_or_else(std::env::temp_dir);

    let mut bridge = Bridge::connect(
        config,
        Arc::new(SimulatedSource::new()),
        Box::new(RecordingActuator::new()),
        Box::new(ScriptedSession::new()),
    )?;

    let first = bridge.reset()?;
    let mut frames = vec![first.observation.as_ref().clone()];
    let mut ticks = Vec::with_capacity(STEPS);
    for k in 0..STEPS {
        let steer = (k as f32 * 0.2).sin();
        let res = bridge.step(RawAction::new(steer, 0.6, 0.0))?;
        if let Some(tick) = res.info.tick {
            ticks.push(tick);
        }
        frames.push(res.observation.as_ref().clone());
    }

    let frames_path = out_dir.join("dry-run-frames.ndjson");
    let ticks_path = out_dir.join("dry-run-ticks.csv");
    bridge_io::export_ndjson(&frames, &frames_path)?;
    bridge_io::export_tick_csv(&ticks, &ticks_path)?;

    let stats = bridge.stats();
    info!(
        steps = stats.step_count,
        overruns = stats.tick.overruns,
        max_drift_ms = stats.tick.max_drift.as_secs_f64() * 1000.0,
        published = bridge.poller_stats().published,
        frames = %frames_path.display(),
        ticks = %ticks_path.display(),
        "dry run finished"
    );
    bridge.close();
    Ok(())
}
