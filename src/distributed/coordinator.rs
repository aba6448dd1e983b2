//! Distributed coordinator
//!
//! This module implements the coordinator process.
//! The coordinator:
//! - Accepts worker connections in the background
//! - Announces its address while discoverable
//! - Runs rounds over a snapshot of the connected workers
//! - Keeps the last round's per-worker timing for reporting

use crate::config::CoordinatorConfig;
use crate::distributed::discovery::{self, AnnounceSettings, Announcer};
use crate::distributed::dispatch::{DispatchEngine, RoundError, RoundReport, WorkerStat};
use crate::distributed::registry::{ConnectionRegistry, RegistryEvent};
use crate::matrix::Matrix;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Distributed coordinator
///
/// Rounds are expected to be triggered one at a time.
pub struct Coordinator {
    config: CoordinatorConfig,
    registry: ConnectionRegistry,
    engine: DispatchEngine,
    announcer: Option<Announcer>,
    armed: AtomicBool,
    last_stats: Mutex<Vec<WorkerStat>>,
    local_addr: Option<SocketAddr>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self::build(config, ConnectionRegistry::new())
    }

    /// Create a coordinator that reports worker connects and removals on `observer`
    pub fn with_observer(config: CoordinatorConfig, observer: UnboundedSender<RegistryEvent>) -> Self {
        Self::build(config, ConnectionRegistry::with_observer(observer))
    }

    fn build(config: CoordinatorConfig, registry: ConnectionRegistry) -> Self {
        let engine = DispatchEngine::new(Some(config.task_timeout()));
        Self {
            config,
            registry,
            engine,
            announcer: None,
            armed: AtomicBool::new(false),
            last_stats: Mutex::new(Vec::new()),
            local_addr: None,
        }
    }

    /// Start the task listener and the discovery announcer
    ///
    /// Returns the bound task listener address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let bind = format!("{}:{}", self.config.bind_host, self.config.port);
        let local = self.registry.start(bind.as_str()).await?;
        self.local_addr = Some(local);

        let advertised = SocketAddr::new(self.advertised_ip()?, local.port());
        let broadcast: IpAddr = self
            .config
            .broadcast_addr
            .parse()
            .with_context(|| format!("Invalid broadcast address: {}", self.config.broadcast_addr))?;

        let announcer = Announcer::spawn(AnnounceSettings {
            advertised,
            target: SocketAddr::new(broadcast, self.config.discovery_port),
            interval: self.config.announce_interval(),
        })
        .await?;
        announcer.set_discoverable(!self.is_armed());
        self.announcer = Some(announcer);

        info!("Coordinator ready; workers can connect to {}", advertised);
        Ok(local)
    }

    fn advertised_ip(&self) -> Result<IpAddr> {
        match self.config.advertise_host {
            Some(ref host) => host
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid advertise host: {}", host)),
            None => Ok(discovery::local_ip()),
        }
    }

    /// Task listener address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Arm the next round and stop announcing
    ///
    /// Workers that are already connected are kept.
    pub fn arm_round(&self) {
        if !self.armed.swap(true, Ordering::SeqCst) {
            info!("Round armed with {} worker(s); discovery paused", self.current_worker_count());
        }
        self.set_discoverable(false);
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    pub fn is_discoverable(&self) -> bool {
        self.announcer.as_ref().is_some_and(Announcer::is_discoverable)
    }

    fn set_discoverable(&self, discoverable: bool) {
        if let Some(ref announcer) = self.announcer {
            announcer.set_discoverable(discoverable);
        }
    }

    pub fn current_worker_count(&self) -> usize {
        self.registry.len()
    }

    /// Wait until at least `count` workers are connected
    ///
    /// Returns false if `timeout` elapses first.
    pub async fn wait_for_workers(&self, count: usize, timeout: Duration) -> bool {
        let poll = async {
            loop {
                if self.current_worker_count() >= count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        tokio::time::timeout(timeout, poll).await.is_ok()
    }

    /// Multiply random `rows`x`cols` and `cols`x`rows` operands across the workers
    pub async fn trigger_computation(&self, rows: usize, cols: usize) -> Result<RoundReport, RoundError> {
        // Fail before generating operands
        if self.current_worker_count() == 0 {
            warn!("Computation triggered with no workers connected");
            return Err(RoundError::NoWorkersAvailable);
        }
        debug!("Generating {}x{} and {}x{} operands", rows, cols, cols, rows);
        let a = Matrix::random(rows, cols);
        let b = Matrix::random(cols, rows);
        self.compute(a, b).await
    }

    /// Compute `a * b` across the currently connected workers
    pub async fn compute(&self, a: Matrix, b: Matrix) -> Result<RoundReport, RoundError> {
        self.arm_round();

        let handles = self.registry.current_handles();
        let outcome = self.engine.run_round(Arc::new(a), Arc::new(b), &handles).await;

        match outcome {
            Ok(ref report) => self.record_stats(report.stats.clone()),
            Err(RoundError::PartialRoundFailure(ref partial)) => {
                for id in &partial.failed_handles {
                    self.registry.remove(*id);
                }
                self.record_stats(partial.stats.clone());
            }
            Err(_) => {}
        }

        self.reset();
        outcome
    }

    /// Clear the armed flag and resume announcing
    fn reset(&self) {
        self.armed.store(false, Ordering::SeqCst);
        self.set_discoverable(true);
        debug!("Round finished; discovery resumed");
    }

    fn record_stats(&self, stats: Vec<WorkerStat>) {
        *self.last_stats.lock().unwrap_or_else(|e| e.into_inner()) = stats;
    }

    /// Per-worker timing from the most recent round
    pub fn per_worker_stats(&self) -> Vec<WorkerStat> {
        self.last_stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stop announcing and close every worker connection
    ///
    /// Exchanges of an interrupted round are aborted so that no task keeps a
    /// stream open.
    pub fn shutdown(&mut self) {
        if let Some(announcer) = self.announcer.take() {
            announcer.stop();
        }
        self.engine.abort_in_flight();
        self.registry.close_all();
        info!("Coordinator shut down");
    }
}
