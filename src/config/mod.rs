//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.

pub mod cli;
pub mod cli_convert;
pub mod toml;
pub mod validator;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Complete process configuration
///
/// Only the section matching the selected mode is used at runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Coordinator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Task listener bind host
    pub bind_host: String,
    /// Task listener port
    pub port: u16,
    /// UDP port workers listen on for announcements
    pub discovery_port: u16,
    /// Announcement destination
    pub broadcast_addr: String,
    /// IP announced to workers (default: address of the default route)
    pub advertise_host: Option<String>,
    /// Delay between announcements (milliseconds)
    pub announce_interval_ms: u64,
    /// Per-worker exchange timeout (milliseconds)
    pub task_timeout_ms: u64,
}

impl CoordinatorConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: 5000,
            discovery_port: 5001,
            broadcast_addr: "255.255.255.255".to_string(),
            advertise_host: None,
            announce_interval_ms: 2000,
            task_timeout_ms: 600_000,
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Coordinator task address (`ip:port`); discovery is used when unset
    pub coordinator: Option<String>,
    pub discovery_port: u16,
    /// Wait after a failed connect (milliseconds)
    pub reconnect_backoff_ms: u64,
    /// Extra attempts for a failed result send
    pub send_retries: u32,
    pub send_retry_backoff_ms: u64,
    /// Compute threads (0 = one per CPU)
    pub compute_threads: usize,
    /// Largest task accepted, operands plus result (MiB)
    pub max_task_mb: u64,
}

impl WorkerConfig {
    /// `max_task_mb` in bytes, saturating on narrow targets
    pub fn max_task_bytes(&self) -> usize {
        usize::try_from(self.max_task_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            coordinator: None,
            discovery_port: 5001,
            reconnect_backoff_ms: 2000,
            send_retries: 1,
            send_retry_backoff_ms: 0,
            compute_threads: 0,
            max_task_mb: 4096,
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// JSON report file path
    pub json_output: Option<PathBuf>,
    /// Rows and columns of the result shown in the text report
    pub preview: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            json_output: None,
            preview: 4,
        }
    }
}

// Display trait implementations

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Configuration:")?;
        writeln!(f, "  Coordinator: {}", self.coordinator)?;
        writeln!(f, "  Worker: {}", self.worker)?;
        writeln!(f, "  Output: {}", self.output)?;
        Ok(())
    }
}

impl fmt::Display for CoordinatorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}, discovery {}:{} every {}ms, task timeout {}ms",
            self.bind_host,
            self.port,
            self.broadcast_addr,
            self.discovery_port,
            self.announce_interval_ms,
            self.task_timeout_ms
        )?;
        if let Some(ref host) = self.advertise_host {
            write!(f, ", advertise={}", host)?;
        }
        Ok(())
    }
}

impl fmt::Display for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.coordinator {
            Some(ref addr) => write!(f, "coordinator={}", addr)?,
            None => write!(f, "discovery on port {}", self.discovery_port)?,
        }
        write!(f, ", {} send retr(ies)", self.send_retries)?;
        if self.compute_threads == 0 {
            write!(f, ", threads=auto")
        } else {
            write!(f, ", threads={}", self.compute_threads)
        }
    }
}

impl fmt::Display for OutputConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.json_output {
            Some(ref path) => write!(f, "json={}", path.display()),
            None => write!(f, "text output"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.coordinator.port, 5000);
        assert_eq!(config.coordinator.discovery_port, 5001);
        assert_eq!(config.coordinator.announce_interval(), Duration::from_secs(2));
        assert_eq!(config.coordinator.task_timeout(), Duration::from_secs(600));
        assert_eq!(config.worker.discovery_port, 5001);
        assert_eq!(config.worker.send_retries, 1);
        assert_eq!(config.worker.max_task_bytes(), 4096 * 1024 * 1024);
        assert!(config.worker.coordinator.is_none());
        assert_eq!(config.output.preview, 4);
    }

    #[test]
    fn test_display() {
        let mut config = Config::default();
        let text = config.to_string();
        assert!(text.contains("0.0.0.0:5000"));
        assert!(text.contains("discovery on port 5001"));
        assert!(text.contains("text output"));

        config.worker.coordinator = Some("10.0.0.1:5000".to_string());
        config.worker.compute_threads = 8;
        assert_eq!(
            config.worker.to_string(),
            "coordinator=10.0.0.1:5000, 1 send retr(ies), threads=8"
        );
    }
}
