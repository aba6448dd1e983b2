//! Human-readable text output

use crate::distributed::dispatch::{PartialRound, RoundReport, WorkerStat};
use crate::matrix::Matrix;
use std::fmt::Write;
use std::time::Duration;

/// Print a completed round to console
///
/// Displays:
/// - Elapsed round time
/// - Result shape and bytes returned
/// - Per-worker rows and compute time
/// - Top-left corner of the result
pub fn print_round_report(report: &RoundReport, preview: usize) {
    println!("═══════════════════════════════════════════════════════════");
    println!("                    ROUND RESULTS");
    println!("═══════════════════════════════════════════════════════════");
    println!();

    print_summary(&report.result, report.elapsed);
    print_worker_stats(&report.stats);

    if preview > 0 {
        println!("Result preview:");
        print!("{}", format_preview(&report.result, preview));
        println!();
    }
}

/// Print a round where some workers returned nothing
pub fn print_partial_failure(partial: &PartialRound, preview: usize) {
    println!("═══════════════════════════════════════════════════════════");
    println!("                ROUND INCOMPLETE");
    println!("═══════════════════════════════════════════════════════════");
    println!();

    print_summary(&partial.result, partial.elapsed);

    println!("Missing blocks:");
    for block in &partial.missing {
        println!(
            "  {:<22} rows {:>8}..{:<8} {}",
            block.address.to_string(),
            block.rows.start,
            block.rows.end,
            block.reason
        );
    }
    println!();

    print_worker_stats(&partial.stats);

    if preview > 0 {
        println!("Result preview (missing rows are NaN):");
        print!("{}", format_preview(&partial.result, preview));
        println!();
    }
}

/// Print per-worker timing
pub fn print_worker_stats(stats: &[WorkerStat]) {
    if stats.is_empty() {
        println!("No worker statistics yet");
        println!();
        return;
    }

    println!("Workers:");
    println!("  {:<22} {:>10} {:>10} {:>12}", "Address", "First row", "Rows", "Compute");
    for stat in stats {
        println!(
            "  {:<22} {:>10} {:>10} {:>11.3}s",
            stat.address.to_string(),
            format_number(stat.row_start as u64),
            format_number(stat.rows_processed as u64),
            stat.duration_seconds
        );
    }

    let slowest = stats
        .iter()
        .map(|s| s.duration_seconds)
        .fold(0.0_f64, f64::max);
    let total_rows: usize = stats.iter().map(|s| s.rows_processed).sum();
    println!(
        "  {} worker(s), {} rows, slowest {:.3}s",
        stats.len(),
        format_number(total_rows as u64),
        slowest
    );
    println!();
}

fn print_summary(result: &Matrix, elapsed: Duration) {
    println!("Elapsed Time: {:.3}s", elapsed.as_secs_f64());
    println!(
        "Result:       {} x {} ({})",
        format_number(result.rows() as u64),
        format_number(result.cols() as u64),
        format_bytes((result.as_slice().len() * 8) as u64)
    );
    println!();
}

/// Top-left `n`x`n` corner of `matrix`, one line per row
pub fn format_preview(matrix: &Matrix, n: usize) -> String {
    let rows = matrix.rows().min(n);
    let cols = matrix.cols().min(n);
    let mut out = String::new();

    for i in 0..rows {
        out.push_str("  ");
        for value in &matrix.row(i)[..cols] {
            let _ = write!(out, "{:>12.4}", value);
        }
        if cols < matrix.cols() {
            out.push_str("  ...");
        }
        out.push('\n');
    }
    if rows < matrix.rows() {
        out.push_str("  ...\n");
    }
    out
}

/// Format number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}

/// Format bytes in human-readable format
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
