//! JSON output formatting
//!
//! One report per round with:
//! - Generation timestamp
//! - Round status, elapsed time and result shape
//! - Per-worker timing
//! - Row ranges no worker returned (partial rounds only)

use crate::distributed::dispatch::{MissingBlock, PartialRound, RoundReport, WorkerStat};
use crate::Result;
use anyhow::Context;
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Duration with both microseconds and human-readable format
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonDuration {
    pub micros: u64,
    pub human: String,
}

impl JsonDuration {
    pub fn from_duration(d: Duration) -> Self {
        let micros = u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
        let human = format_duration_human(d);
        Self { micros, human }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Complete,
    Partial,
}

/// Round report as written to disk
#[derive(Debug, Clone, Serialize)]
pub struct JsonRoundOutput {
    /// RFC 3339 UTC timestamp
    pub generated_at: String,
    pub status: RoundStatus,
    pub elapsed: JsonDuration,
    pub result_rows: usize,
    pub result_cols: usize,
    pub workers: Vec<WorkerStat>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing: Vec<MissingBlock>,
}

impl JsonRoundOutput {
    pub fn from_report(report: &RoundReport) -> Self {
        Self {
            generated_at: timestamp(),
            status: RoundStatus::Complete,
            elapsed: JsonDuration::from_duration(report.elapsed),
            result_rows: report.result.rows(),
            result_cols: report.result.cols(),
            workers: report.stats.clone(),
            missing: Vec::new(),
        }
    }

    pub fn from_partial(partial: &PartialRound) -> Self {
        Self {
            generated_at: timestamp(),
            status: RoundStatus::Partial,
            elapsed: JsonDuration::from_duration(partial.elapsed),
            result_rows: partial.result.rows(),
            result_cols: partial.result.cols(),
            workers: partial.stats.clone(),
            missing: partial.missing.clone(),
        }
    }
}

fn timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Write a round report to `output_path`
pub fn write_round_json(output_path: &Path, output: &JsonRoundOutput, pretty: bool) -> Result<()> {
    let file = File::create(output_path)
        .with_context(|| format!("Failed to create JSON output: {}", output_path.display()))?;
    let mut writer = BufWriter::new(file);

    if pretty {
        serde_json::to_writer_pretty(&mut writer, output)?;
    } else {
        serde_json::to_writer(&mut writer, output)?;
    }
    writer.flush()?;

    Ok(())
}

/// Output path for `round` of `total`: `report.json` becomes `report-2.json`
///
/// A single-round run keeps the path unchanged.
pub fn round_output_path(path: &Path, round: usize, total: usize) -> PathBuf {
    if total <= 1 {
        return path.to_path_buf();
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "round".to_string());
    let name = match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, round, ext.to_string_lossy()),
        None => format!("{}-{}", stem, round),
    };
    path.with_file_name(name)
}

/// Format duration in human-readable format
fn format_duration_human(d: Duration) -> String {
    let micros = d.as_micros();

    if micros == 0 {
        return "0µs".to_string();
    }

    if micros < 1000 {
        format!("{}µs", micros)
    } else if micros < 1_000_000 {
        format!("{:.3}ms", micros as f64 / 1000.0)
    } else if micros < 60_000_000 {
        format!("{:.3}s", micros as f64 / 1_000_000.0)
    } else {
        format!("{:.2}m", micros as f64 / 60_000_000.0)
    }
}
