//! TOML configuration file parsing

use super::*;
use crate::config::cli::Cli;
use crate::config::cli_convert::parse_duration_ms;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    // Override coordinator settings
    if let Some(ref host) = cli.host {
        config.coordinator.bind_host = host.clone();
    }
    if let Some(port) = cli.port {
        config.coordinator.port = port;
    }
    if let Some(ref addr) = cli.broadcast_addr {
        config.coordinator.broadcast_addr = addr.clone();
    }
    if let Some(ref host) = cli.advertise_host {
        config.coordinator.advertise_host = Some(host.clone());
    }
    if let Some(ref interval) = cli.announce_interval {
        config.coordinator.announce_interval_ms = parse_duration_ms(interval)?;
    }
    if let Some(ref timeout) = cli.task_timeout {
        config.coordinator.task_timeout_ms = parse_duration_ms(timeout)?;
    }

    // Discovery port is shared by both sides
    if let Some(port) = cli.discovery_port {
        config.coordinator.discovery_port = port;
        config.worker.discovery_port = port;
    }

    // Override worker settings
    if let Some(ref addr) = cli.coordinator {
        config.worker.coordinator = Some(addr.clone());
    }
    if let Some(ref backoff) = cli.reconnect_backoff {
        config.worker.reconnect_backoff_ms = parse_duration_ms(backoff)?;
    }
    if let Some(retries) = cli.send_retries {
        config.worker.send_retries = retries;
    }
    if let Some(threads) = cli.compute_threads {
        config.worker.compute_threads = threads;
    }
    if let Some(limit) = cli.max_task_mb {
        config.worker.max_task_mb = limit;
    }

    // Override output settings
    if let Some(ref path) = cli.json_output {
        config.output.json_output = Some(path.clone());
    }
    if let Some(preview) = cli.preview {
        config.output.preview = preview;
    }

    Ok(config)
}
