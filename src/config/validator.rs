//! Configuration validation

use super::*;
use anyhow::Result;
use std::net::{IpAddr, SocketAddr};

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_coordinator(&config.coordinator)?;
    validate_worker(&config.worker)?;
    Ok(())
}

/// Validate coordinator configuration
pub fn validate_coordinator(coordinator: &CoordinatorConfig) -> Result<()> {
    if coordinator.port == 0 {
        anyhow::bail!("coordinator.port must be greater than 0");
    }
    if coordinator.discovery_port == 0 {
        anyhow::bail!("coordinator.discovery_port must be greater than 0");
    }
    if coordinator.port == coordinator.discovery_port {
        anyhow::bail!(
            "coordinator.port and coordinator.discovery_port must differ (both {})",
            coordinator.port
        );
    }

    if coordinator.broadcast_addr.parse::<IpAddr>().is_err() {
        anyhow::bail!(
            "coordinator.broadcast_addr is not an IP address: {}",
            coordinator.broadcast_addr
        );
    }
    if let Some(ref host) = coordinator.advertise_host {
        if host.parse::<IpAddr>().is_err() {
            anyhow::bail!("coordinator.advertise_host is not an IP address: {}", host);
        }
    }

    if coordinator.announce_interval_ms == 0 {
        anyhow::bail!("coordinator.announce_interval_ms must be greater than 0");
    }
    if coordinator.task_timeout_ms == 0 {
        anyhow::bail!("coordinator.task_timeout_ms must be greater than 0");
    }

    Ok(())
}

/// Validate worker configuration
pub fn validate_worker(worker: &WorkerConfig) -> Result<()> {
    if worker.discovery_port == 0 {
        anyhow::bail!("worker.discovery_port must be greater than 0");
    }
    if let Some(ref addr) = worker.coordinator {
        if addr.parse::<SocketAddr>().is_err() {
            anyhow::bail!("worker.coordinator must be ip:port, got {}", addr);
        }
    }
    if worker.reconnect_backoff_ms == 0 {
        anyhow::bail!("worker.reconnect_backoff_ms must be greater than 0");
    }
    if worker.max_task_mb == 0 {
        anyhow::bail!("worker.max_task_mb must be greater than 0");
    }

    // Warn if thread count is very high
    if worker.compute_threads > 1024 {
        log::warn!(
            "Very high compute thread count ({}), this may cause performance issues",
            worker.compute_threads
        );
    }

    Ok(())
}
