//! Serialization at the edges of the bridge: the wire protocol for remote
//! consumers, and file recordings of frames and tick timing.

mod protocol;

pub use protocol::{
    Codec, ControlPayload, ErrorPayload, FrameBatcher, Message, MessageKind, TelemetryPayload, TransitionPayload,
};

use anyhow::{Context, Result};
use model::*;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::{fs::File, path::Path};

/// One frame per line.
pub fn export_ndjson(frames: &[TelemetryFrame], path: &Path) -> Result<()> {
    let f = File::create(path).with_context(|| format!("create {}", path.display()))?;
    let mut w = std::io::BufWriter::new(f);
    for frame in frames {
        let s = serde_json::to_string(frame)?;
        writeln!(w, "{}", s)?;
    }
    w.flush()?;
    Ok(())
}

pub fn import_ndjson(path: &Path) -> Result<Vec<TelemetryFrame>> {
    let f = File::open(path).with_context(|| format!("open {}", path.display()))?;
    let rdr = std::io::BufReader::new(f);
    let mut frames = vec![];
    for (n, line) in rdr.lines().enumerate() {
        let s = line?;
        if s.trim().is_empty() {
            continue;
        }
        let frame: TelemetryFrame =
            serde_json::from_str(&s).with_context(|| format!("{}:{}", path.display(), n + 1))?;
        frames.push(frame);
    }
    Ok(frames)
}

/// Tick timing log, milliseconds throughout.
pub fn export_tick_csv(ticks: &[TickRecord], path: &Path) -> Result<()> {
    let mut w = csv::Writer::from_path(path).with_context(|| format!("create {}", path.display()))?;
    for t in ticks {
        w.serialize(TickRow::from(t))?;
    }
    w.flush()?;
    Ok(())
}

pub fn import_tick_csv(path: &Path) -> Result<Vec<TickRow>> {
    let mut rdr = csv::Reader::from_path(path).with_context(|| format!("open {}", path.display()))?;
    let mut rows = vec![];
    for rec in rdr.deserialize() {
        rows.push(rec?);
    }
    Ok(rows)
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TickRow {
    pub sequence: u64,
    pub wall_time_ms: f64,
    pub target_ms: f64,
    pub actual_ms: f64,
    pub drift_ms: f64,
}

impl From<&TickRecord> for TickRow {
    fn from(t: &TickRecord) -> Self {
        let ms = |d: std::time::Duration| d.as_secs_f64() * 1000.0;
        Self {
            sequence: t.sequence,
            wall_time_ms: ms(t.wall_time),
            target_ms: ms(t.target_interval),
            actual_ms: ms(t.actual_interval),
            drift_ms: ms(t.drift),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    fn temp(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("bridge-io-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_ndjson_recording() {
        let frames: Vec<TelemetryFrame> = (0..3)
            .map(|i| {
                let mut fields = NamedFields::new();
                fields.insert("rpm".into(), (4000.0 + i as f64).into());
                TelemetryFrame {
                    sequence: i,
                    captured_at: Duration::from_millis(16 * i),
                    target_interval: Duration::from_millis(16),
                    actual_interval: Duration::from_millis(16),
                    fields,
                }
            })
            .collect();
        let path = temp("frames.ndjson");
        export_ndjson(&frames, &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 3);

        let back = import_ndjson(&path).unwrap();
        assert_eq!(back, frames);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_ndjson_reports_bad_line() {
        let path = temp("bad.ndjson");
        std::fs::write(&path, "\n{\"sequence\": 1}\n").unwrap();
        let err = import_ndjson(&path).unwrap_err();
        assert!(format!("{err:#}").contains(":2"), "{err:#}");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_tick_csv_in_milliseconds() {
        let ticks = [TickRecord {
            sequence: 9,
            wall_time: Duration::from_millis(1_000),
            target_interval: Duration::from_millis(100),
            actual_interval: Duration::from_micros(101_500),
            drift: Duration::from_micros(1_500),
        }];
        let path = temp("ticks.csv");
        export_tick_csv(&ticks, &path).unwrap();
        let header = std::fs::read_to_string(&path).unwrap();
        assert!(header.starts_with("sequence,wall_time_ms,target_ms,actual_ms,drift_ms"));

        let rows = import_tick_csv(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sequence, 9);
        assert!((rows[0].actual_ms - 101.5).abs() < 1e-9);
        assert!((rows[0].drift_ms - 1.5).abs() < 1e-9);
        std::fs::remove_file(&path).unwrap();
    }
}
