//! Worker session
//!
//! This module implements the process that runs on each worker node.
//! The session:
//! - Finds the coordinator (static address or one discovery announcement)
//! - Connects and serves tasks one at a time
//! - Sends each result with a bounded retry
//! - Falls back to discovery whenever the connection ends
//!
//! # States
//!
//! ```text
//! DISCOVERING -> CONNECTING -> SERVING -> RECONNECTING -> DISCOVERING
//!                    |                                        ^
//!                    +------ (connect failed, backoff) -------+
//! ```

use crate::config::WorkerConfig;
use crate::distributed::discovery;
use crate::distributed::protocol::{self, WireError, WireResult};
use crate::distributed::retry::RetryPolicy;
use crate::matrix::Matrix;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Worker session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Discovering,
    Connecting(SocketAddr),
    Serving(SocketAddr),
    Reconnecting,
}

/// How a served connection ended without a transport error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Peer closed between tasks
    Disconnected { tasks: u64 },
}

/// Session settings resolved from configuration
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Fixed coordinator address; `None` uses discovery
    pub coordinator: Option<SocketAddr>,
    pub discovery_port: u16,
    /// Wait after a failed connect before rediscovering
    pub reconnect_backoff: Duration,
    pub send_retry: RetryPolicy,
    /// Compute threads (0 = one per CPU)
    pub compute_threads: usize,
    /// Largest task accepted, operands plus result (bytes)
    pub max_task_bytes: usize,
}

impl SessionSettings {
    pub fn from_config(config: &WorkerConfig) -> Result<Self> {
        let coordinator = match config.coordinator {
            Some(ref addr) => Some(
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("Invalid coordinator address: {}", addr))?,
            ),
            None => None,
        };

        Ok(Self {
            coordinator,
            discovery_port: config.discovery_port,
            reconnect_backoff: Duration::from_millis(config.reconnect_backoff_ms),
            send_retry: RetryPolicy::new(
                config.send_retries,
                Duration::from_millis(config.send_retry_backoff_ms),
            ),
            compute_threads: config.compute_threads,
            max_task_bytes: config.max_task_bytes(),
        })
    }
}

/// Worker session
///
/// Serves exactly one task at a time; the next header is not read until the
/// previous result has been written or abandoned.
pub struct WorkerSession {
    settings: SessionSettings,
    pool: Arc<rayon::ThreadPool>,
    node_id: String,
    state: SessionState,
    tasks_served: u64,
}

impl WorkerSession {
    pub fn new(settings: SessionSettings) -> Result<Self> {
        let threads = if settings.compute_threads == 0 {
            num_cpus::get()
        } else {
            settings.compute_threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("compute-{}", i))
            .build()
            .context("Failed to build compute thread pool")?;

        Ok(Self {
            settings,
            pool: Arc::new(pool),
            node_id: get_node_id(),
            state: SessionState::Discovering,
            tasks_served: 0,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Tasks whose result was delivered, across all connections
    pub fn tasks_served(&self) -> u64 {
        self.tasks_served
    }

    /// Run until `shutdown` resolves
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            "Worker {} starting ({} compute threads)",
            self.node_id,
            self.pool.current_num_threads()
        );

        tokio::select! {
            _ = shutdown => {}
            _ = self.drive() => {}
        }
        info!("Worker {} shutting down after {} task(s)", self.node_id, self.tasks_served);
        Ok(())
    }

    async fn drive(&mut self) {
        loop {
            self.state = match std::mem::replace(&mut self.state, SessionState::Reconnecting) {
                SessionState::Discovering => match self.find_coordinator().await {
                    Ok(addr) => SessionState::Connecting(addr),
                    Err(e) => {
                        warn!("Discovery failed: {:#}", e);
                        tokio::time::sleep(self.settings.reconnect_backoff).await;
                        SessionState::Discovering
                    }
                },
                SessionState::Connecting(addr) => match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        info!("Connected to coordinator at {}", addr);
                        self.state = SessionState::Serving(addr);
                        self.serve_stream(stream, addr).await;
                        SessionState::Reconnecting
                    }
                    Err(e) => {
                        warn!(
                            "Connect to {} failed: {}; retrying in {:?}",
                            addr, e, self.settings.reconnect_backoff
                        );
                        tokio::time::sleep(self.settings.reconnect_backoff).await;
                        SessionState::Discovering
                    }
                },
                // Only reachable if a serve was interrupted; treat like a lost connection
                SessionState::Serving(_) => SessionState::Reconnecting,
                SessionState::Reconnecting => {
                    debug!("Connection closed; returning to discovery");
                    SessionState::Discovering
                }
            };
        }
    }

    async fn find_coordinator(&self) -> Result<SocketAddr> {
        if let Some(addr) = self.settings.coordinator {
            return Ok(addr);
        }
        info!(
            "Waiting for coordinator announcement on UDP port {}",
            self.settings.discovery_port
        );
        let addr = discovery::discover_coordinator(self.settings.discovery_port).await?;
        info!("Discovered coordinator at {}", addr);
        Ok(addr)
    }

    async fn serve_stream(&mut self, mut stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        match self.serve_connection(&mut stream).await {
            Ok(ServeOutcome::Disconnected { tasks }) => {
                info!("Coordinator {} closed the connection after {} task(s)", addr, tasks)
            }
            Err(e) => warn!("Connection to {} ended: {}", addr, e),
        }
        // Stream is dropped (closed) here before rediscovery
    }

    /// Serve tasks on one connection until the peer closes it
    ///
    /// A clean close between tasks returns `Disconnected`. Transport and
    /// header errors end the connection with an error. A header over the task
    /// size limit is rejected before it is acknowledged.
    pub async fn serve_connection<S>(&mut self, stream: &mut S) -> WireResult<ServeOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut tasks = 0;
        loop {
            let Some(header) = protocol::read_header(stream).await? else {
                return Ok(ServeOutcome::Disconnected { tasks });
            };
            debug!("Task header {}", header);
            header.ensure_within(self.settings.max_task_bytes)?;
            protocol::write_ack(stream).await?;

            let (a, b) = protocol::read_operands(stream, &header).await?;
            let (result, duration_secs) = self.compute(a, b).await?;
            debug!(
                "Computed {}x{} block in {:.3}s",
                result.rows(),
                result.cols(),
                duration_secs
            );

            let frame = protocol::encode_result(&result, duration_secs);
            match self.settings.send_retry.write_frame(stream, &frame).await {
                Ok(_) => {
                    tasks += 1;
                    self.tasks_served += 1;
                }
                // The coordinator sees a missing result; the next header read
                // tells us whether the connection survived
                Err(e) => warn!("Abandoning result for {}: {}", header, e),
            }
        }
    }

    /// Multiply on the compute pool, timing only the product itself
    async fn compute(&self, a: Matrix, b: Matrix) -> WireResult<(Matrix, f64)> {
        let pool = self.pool.clone();
        let joined = tokio::task::spawn_blocking(move || {
            pool.install(|| {
                let started = Instant::now();
                let product = a.multiply(&b);
                (product, started.elapsed().as_secs_f64())
            })
        })
        .await
        .map_err(|e| WireError::Io(io::Error::new(io::ErrorKind::Other, format!("compute task failed: {}", e))))?;

        let (product, secs) = joined;
        Ok((product?, secs))
    }
}

/// Identify this node in logs (hostname, or "unknown")
fn get_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::dispatch::{dispatch_task, Task};
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};
    use tokio::io::{duplex, ReadBuf};
    use tokio::net::TcpListener;

    fn settings() -> SessionSettings {
        SessionSettings {
            coordinator: None,
            discovery_port: 0,
            reconnect_backoff: Duration::from_millis(10),
            send_retry: RetryPolicy::once(),
            compute_threads: 2,
            max_task_bytes: 1 << 20,
        }
    }

    fn operands() -> (Arc<Matrix>, Arc<Matrix>) {
        let a = Matrix::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0], vec![7.0, 8.0, 9.0]]).unwrap();
        let b = Matrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]]).unwrap();
        (Arc::new(a), Arc::new(b))
    }

    /// Stream whose `fail_write`-th write call fails without writing anything
    ///
    /// Every other write accepts at most `max_write` bytes.
    struct FailNthWrite<S> {
        inner: S,
        writes: usize,
        fail_write: usize,
        max_write: usize,
    }

    impl<S> FailNthWrite<S> {
        fn new(inner: S, fail_write: usize) -> Self {
            Self {
                inner,
                writes: 0,
                fail_write,
                max_write: usize::MAX,
            }
        }
    }

    impl<S: AsyncRead + Unpin> AsyncRead for FailNthWrite<S> {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_read(cx, buf)
        }
    }

    impl<S: AsyncWrite + Unpin> AsyncWrite for FailNthWrite<S> {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut TaskContext<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.writes += 1;
            if self.writes == self.fail_write {
                return Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated")));
            }
            let len = buf.len().min(self.max_write);
            Pin::new(&mut self.inner).poll_write(cx, &buf[..len])
        }

        fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_flush(cx)
        }

        fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.inner).poll_shutdown(cx)
        }
    }

    #[tokio::test]
    async fn test_serves_tasks_until_disconnect() {
        let (a, b) = operands();
        let expected = a.multiply(&b).unwrap();
        let (mut coordinator, mut worker_side) = duplex(256);

        let worker = tokio::spawn(async move {
            let mut session = WorkerSession::new(settings()).unwrap();
            let outcome = session.serve_connection(&mut worker_side).await;
            (outcome, session.tasks_served())
        });

        let (top, _) = dispatch_task(&mut coordinator, &Task::new(0..2, a.clone(), b.clone()))
            .await
            .unwrap();
        let (bottom, duration) = dispatch_task(&mut coordinator, &Task::new(2..3, a.clone(), b.clone()))
            .await
            .unwrap();
        drop(coordinator);

        let (outcome, served) = worker.await.unwrap();
        assert_eq!(outcome.unwrap(), ServeOutcome::Disconnected { tasks: 2 });
        assert_eq!(served, 2);
        assert!(duration >= 0.0);

        let stacked = Matrix::vstack(2, &[top, bottom]).unwrap();
        assert_eq!(stacked, expected);
    }

    #[tokio::test]
    async fn test_empty_block_is_a_no_op() {
        let (a, b) = operands();
        let (mut coordinator, mut worker_side) = duplex(256);

        let worker = tokio::spawn(async move {
            let mut session = WorkerSession::new(settings()).unwrap();
            session.serve_connection(&mut worker_side).await
        });

        let (block, _) = dispatch_task(&mut coordinator, &Task::new(3..3, a, b)).await.unwrap();
        drop(coordinator);

        assert_eq!(block.shape(), (0, 2));
        assert_eq!(worker.await.unwrap().unwrap(), ServeOutcome::Disconnected { tasks: 1 });
    }

    #[tokio::test]
    async fn test_malformed_header_ends_connection() {
        let (mut coordinator, mut worker_side) = duplex(256);

        let worker = tokio::spawn(async move {
            let mut session = WorkerSession::new(settings()).unwrap();
            session.serve_connection(&mut worker_side).await
        });

        tokio::io::AsyncWriteExt::write_all(&mut coordinator, b"3,three,3,2\n")
            .await
            .unwrap();

        let outcome = worker.await.unwrap();
        assert!(matches!(outcome, Err(WireError::HeaderParse { .. })));
    }

    #[tokio::test]
    async fn test_oversized_task_rejected_before_ack() {
        let (mut coordinator, mut worker_side) = duplex(256);

        let worker = tokio::spawn(async move {
            let mut session = WorkerSession::new(settings()).unwrap();
            session.serve_connection(&mut worker_side).await
        });

        tokio::io::AsyncWriteExt::write_all(&mut coordinator, b"100000000000,100000,100000,1\n")
            .await
            .unwrap();

        match worker.await.unwrap() {
            Err(WireError::HeaderParse { reason, .. }) => assert!(reason.contains("limit")),
            other => panic!("expected HeaderParse, got {other:?}"),
        }
        // No ACK was sent; the worker side is closed
        let mut rest = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut coordinator, &mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_result_send_retried_once() {
        let (a, b) = operands();
        let expected = a.multiply(&b).unwrap();
        let (mut coordinator, worker_side) = duplex(4096);

        // Write #1 is the ACK, write #2 is the first chunk of the result frame
        let mut flaky = FailNthWrite::new(worker_side, 2);
        let worker = tokio::spawn(async move {
            let mut session = WorkerSession::new(settings()).unwrap();
            session.serve_connection(&mut flaky).await
        });

        let (first, _) = dispatch_task(&mut coordinator, &Task::new(0..3, a.clone(), b.clone()))
            .await
            .unwrap();
        // A duplicated frame would corrupt this second exchange
        let (second, _) = dispatch_task(&mut coordinator, &Task::new(0..3, a, b)).await.unwrap();
        drop(coordinator);

        assert_eq!(first, expected);
        assert_eq!(second, expected);
        assert_eq!(worker.await.unwrap().unwrap(), ServeOutcome::Disconnected { tasks: 2 });
    }

    #[tokio::test]
    async fn test_result_retry_after_partial_write_keeps_values() {
        let a = Arc::new(Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap());
        let identity = Arc::new(Matrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0]]).unwrap());
        let (mut coordinator, worker_side) = duplex(4096);

        // Write #1 is the ACK, write #2 carries the first 16 result bytes,
        // write #3 fails partway through the frame
        let mut flaky = FailNthWrite {
            max_write: 16,
            ..FailNthWrite::new(worker_side, 3)
        };
        let worker = tokio::spawn(async move {
            let mut session = WorkerSession::new(settings()).unwrap();
            let outcome = session.serve_connection(&mut flaky).await;
            (outcome, session.tasks_served())
        });

        let (block, _) = dispatch_task(&mut coordinator, &Task::new(0..2, a.clone(), identity.clone()))
            .await
            .unwrap();
        assert_eq!(block.as_slice(), &[1.0, 2.0, 3.0, 4.0]);

        // The stream stays aligned for the next task
        let (again, _) = dispatch_task(&mut coordinator, &Task::new(1..2, a, identity)).await.unwrap();
        assert_eq!(again.as_slice(), &[3.0, 4.0]);
        drop(coordinator);

        let (outcome, served) = worker.await.unwrap();
        assert_eq!(outcome.unwrap(), ServeOutcome::Disconnected { tasks: 2 });
        assert_eq!(served, 2);
    }

    #[tokio::test]
    async fn test_run_reconnects_after_coordinator_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let session = WorkerSession::new(SessionSettings {
            coordinator: Some(addr),
            ..settings()
        })
        .unwrap();

        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let worker = tokio::spawn(session.run(async {
            let _ = stop_rx.await;
        }));

        let (a, b) = operands();
        let expected = a.multiply(&b).unwrap();
        for _ in 0..2 {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (block, _) = dispatch_task(&mut stream, &Task::new(0..3, a.clone(), b.clone()))
                .await
                .unwrap();
            assert_eq!(block, expected);
            // Closing forces the worker back through discovery and reconnect
        }

        stop_tx.send(()).unwrap();
        worker.await.unwrap().unwrap();
    }

    #[test]
    fn test_settings_from_config() {
        let config = WorkerConfig {
            coordinator: Some("10.0.0.5:5000".to_string()),
            ..WorkerConfig::default()
        };
        let settings = SessionSettings::from_config(&config).unwrap();
        assert_eq!(settings.coordinator, Some("10.0.0.5:5000".parse().unwrap()));
        assert_eq!(settings.send_retry, RetryPolicy::once());
        assert_eq!(settings.reconnect_backoff, Duration::from_secs(2));
        assert_eq!(settings.max_task_bytes, config.max_task_bytes());

        let bad = WorkerConfig {
            coordinator: Some("not-an-address".to_string()),
            ..WorkerConfig::default()
        };
        assert!(SessionSettings::from_config(&bad).is_err());
    }
}
