//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutionMode {
    /// Coordinator mode - accept workers and run rounds
    Coordinator,
    /// Worker mode - find a coordinator and serve tasks
    Worker,
}

/// dmatmul - Distributed dense matrix multiplication
#[derive(Parser, Debug)]
#[command(name = "dmatmul")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Execution mode: coordinator or worker
    #[arg(long, value_enum, default_value = "coordinator")]
    pub mode: ExecutionMode,

    /// TOML configuration file (CLI options take precedence)
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    // === Coordinator Options ===
    /// Task listener bind host
    #[arg(long)]
    pub host: Option<String>,

    /// Task listener port (default: 5000)
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// UDP discovery port, used by both modes (default: 5001)
    #[arg(long)]
    pub discovery_port: Option<u16>,

    /// Announcement destination (default: 255.255.255.255)
    #[arg(long)]
    pub broadcast_addr: Option<String>,

    /// IP to announce to workers instead of the detected one
    #[arg(long)]
    pub advertise_host: Option<String>,

    /// Delay between announcements (e.g., 500ms, 2s)
    #[arg(long)]
    pub announce_interval: Option<String>,

    /// Per-worker exchange timeout (e.g., 30s, 10m)
    #[arg(long)]
    pub task_timeout: Option<String>,

    /// Operand size as ROWSxCOLS; A is ROWSxCOLS and B is COLSxROWS
    #[arg(short = 's', long, default_value = "1000x1000")]
    pub size: String,

    /// Workers to wait for before the first round
    #[arg(long, default_value = "1")]
    pub min_workers: usize,

    /// Maximum time to wait for --min-workers (e.g., 30s, 5m)
    #[arg(long, default_value = "60s")]
    pub wait: String,

    /// Rounds to run before exiting
    #[arg(short = 'r', long, default_value = "1")]
    pub rounds: usize,

    /// Read commands from stdin instead of running rounds automatically
    #[arg(short = 'i', long)]
    pub interactive: bool,

    // === Worker Options ===
    /// Coordinator task address (ip:port); skips discovery
    #[arg(long, env = "DMATMUL_COORDINATOR")]
    pub coordinator: Option<String>,

    /// Wait after a failed connect (e.g., 2s)
    #[arg(long)]
    pub reconnect_backoff: Option<String>,

    /// Extra attempts for a failed result send (default: 1)
    #[arg(long)]
    pub send_retries: Option<u32>,

    /// Compute threads (0 = one per CPU)
    #[arg(long)]
    pub compute_threads: Option<usize>,

    /// Largest task to accept in MiB, operands plus result (default: 4096)
    #[arg(long)]
    pub max_task_mb: Option<u64>,

    // === Output Options ===
    /// Write a JSON report of each round to this file
    #[arg(long)]
    pub json_output: Option<PathBuf>,

    /// Rows and columns of the result to print
    #[arg(long)]
    pub preview: Option<usize>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["dmatmul"]).unwrap();
        assert_eq!(cli.mode, ExecutionMode::Coordinator);
        assert_eq!(cli.size, "1000x1000");
        assert_eq!(cli.min_workers, 1);
        assert_eq!(cli.rounds, 1);
        assert!(!cli.interactive);
        assert!(cli.port.is_none());
    }

    #[test]
    fn test_worker_mode() {
        let cli = Cli::try_parse_from([
            "dmatmul",
            "--mode",
            "worker",
            "--coordinator",
            "10.0.0.2:5000",
            "--send-retries",
            "3",
            "--max-task-mb",
            "256",
        ])
        .unwrap();
        assert_eq!(cli.mode, ExecutionMode::Worker);
        assert_eq!(cli.coordinator.as_deref(), Some("10.0.0.2:5000"));
        assert_eq!(cli.send_retries, Some(3));
        assert_eq!(cli.max_task_mb, Some(256));
    }

    #[test]
    fn test_rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["dmatmul", "--mode", "standalone"]).is_err());
    }
}
