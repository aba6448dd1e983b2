//! Round dispatch and result aggregation
//!
//! One round partitions the rows of A across the handle snapshot, runs one
//! concurrent exchange per handle, waits for every exchange to finish, and
//! reassembles the result blocks in row order.
//!
//! A failed or timed-out exchange never aborts the others. Its row range is
//! reported as missing instead of being dropped from the result.

use crate::distributed::protocol::{self, TaskHeader, WireError};
use crate::distributed::registry::{HandleId, WorkerHandle};
use crate::matrix::{Matrix, MatrixError};
use crate::partition;
use log::{debug, info, warn};
use serde::Serialize;
use std::net::SocketAddr;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::AbortHandle;

/// One worker's assignment: a row range of A plus all of B
#[derive(Debug, Clone)]
pub struct Task {
    rows: Range<usize>,
    a: Arc<Matrix>,
    b: Arc<Matrix>,
}

impl Task {
    /// Build a task over `rows` of `a`
    ///
    /// # Panics
    ///
    /// Panics if `rows` extends past the last row of `a`.
    pub fn new(rows: Range<usize>, a: Arc<Matrix>, b: Arc<Matrix>) -> Self {
        assert!(rows.end <= a.rows(), "task rows {:?} exceed {} rows", rows, a.rows());
        Self { rows, a, b }
    }

    pub fn header(&self) -> TaskHeader {
        TaskHeader::new(self.rows.len(), self.a.cols(), self.b.rows(), self.b.cols())
    }

    /// Row-major values of the assigned A block
    pub fn a_block(&self) -> &[f64] {
        self.a.row_range(self.rows.clone())
    }

    pub fn b(&self) -> &Matrix {
        &self.b
    }
}

/// Why a task produced no result
#[derive(Debug, thiserror::Error)]
pub enum TaskFailure {
    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("no response within {0:?}")]
    TimedOut(Duration),

    #[error("dispatch task aborted: {0}")]
    Aborted(String),
}

/// Completed task output
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub address: SocketAddr,
    pub rows: Range<usize>,
    pub block: Matrix,
    /// Worker-measured compute time
    pub duration_secs: f64,
}

/// Per-worker timing kept for reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStat {
    pub address: SocketAddr,
    pub row_start: usize,
    pub rows_processed: usize,
    pub duration_seconds: f64,
}

impl From<&TaskResult> for WorkerStat {
    fn from(result: &TaskResult) -> Self {
        Self {
            address: result.address,
            row_start: result.rows.start,
            rows_processed: result.rows.len(),
            duration_seconds: result.duration_secs,
        }
    }
}

/// A row range that no worker returned
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissingBlock {
    pub address: SocketAddr,
    pub rows: Range<usize>,
    pub reason: String,
}

/// Fully successful round
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub result: Matrix,
    pub stats: Vec<WorkerStat>,
    pub elapsed: Duration,
}

/// Round where at least one worker failed
///
/// `result` keeps the full height; rows of missing blocks are NaN.
#[derive(Debug, Clone)]
pub struct PartialRound {
    pub result: Matrix,
    pub stats: Vec<WorkerStat>,
    pub missing: Vec<MissingBlock>,
    pub failed_handles: Vec<HandleId>,
    pub elapsed: Duration,
}

impl PartialRound {
    /// Workers the round was dispatched to
    pub fn worker_count(&self) -> usize {
        self.stats.len() + self.missing.len()
    }
}

/// Round-level errors
#[derive(Debug, thiserror::Error)]
pub enum RoundError {
    #[error("no workers available")]
    NoWorkersAvailable,

    #[error(transparent)]
    ShapeMismatch(#[from] MatrixError),

    #[error("round incomplete: {} of {} worker(s) did not return results", .0.missing.len(), .0.worker_count())]
    PartialRoundFailure(Box<PartialRound>),
}

/// Run the producer side of one task over `stream`
///
/// Sends the header, waits for the acknowledgement, streams the A block and B,
/// then blocks until the result block and duration are back.
pub async fn dispatch_task<S>(stream: &mut S, task: &Task) -> Result<(Matrix, f64), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let header = task.header();
    protocol::write_header(stream, &header).await?;
    protocol::read_ack(stream).await?;

    protocol::write_f64s(stream, task.a_block()).await?;
    protocol::write_f64s(stream, task.b().as_slice()).await?;
    stream.flush().await?;

    protocol::read_result(stream, header.a_rows, header.b_cols).await
}

/// Runs rounds over handle snapshots
///
/// Clones share the set of in-flight exchanges.
#[derive(Debug, Clone)]
pub struct DispatchEngine {
    task_timeout: Option<Duration>,
    in_flight: Arc<Mutex<Vec<AbortHandle>>>,
}

impl DispatchEngine {
    /// `task_timeout` bounds each worker's exchange; `None` waits forever
    pub fn new(task_timeout: Option<Duration>) -> Self {
        Self {
            task_timeout,
            in_flight: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Abort every exchange still running
    ///
    /// Aborted exchanges drop their stream handles, and the round they belong
    /// to reports them as missing. Returns how many were running.
    pub fn abort_in_flight(&self) -> usize {
        let handles: Vec<AbortHandle> = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        let running = handles.iter().filter(|h| !h.is_finished()).count();
        for handle in handles {
            handle.abort();
        }
        if running > 0 {
            warn!("Aborted {} in-flight exchange(s)", running);
        }
        running
    }

    /// Compute `a * b` across `handles`
    ///
    /// Fails fast with `NoWorkersAvailable` (no I/O) on an empty snapshot.
    pub async fn run_round(
        &self,
        a: Arc<Matrix>,
        b: Arc<Matrix>,
        handles: &[WorkerHandle],
    ) -> Result<RoundReport, RoundError> {
        if handles.is_empty() {
            return Err(RoundError::NoWorkersAvailable);
        }
        if a.cols() != b.rows() {
            return Err(MatrixError::ShapeMismatch {
                a_rows: a.rows(),
                a_cols: a.cols(),
                b_rows: b.rows(),
                b_cols: b.cols(),
            }
            .into());
        }

        let started = Instant::now();
        let ranges = partition::row_ranges(a.rows(), handles.len());
        info!(
            "Round: {}x{} * {}x{} across {} worker(s)",
            a.rows(),
            a.cols(),
            b.rows(),
            b.cols(),
            handles.len()
        );

        let mut pending = Vec::with_capacity(handles.len());
        for (handle, rows) in handles.iter().zip(ranges) {
            let task = Task::new(rows.clone(), a.clone(), b.clone());
            let meta = (handle.id(), handle.addr());
            let handle = handle.clone();
            let timeout = self.task_timeout;
            debug!("Dispatching rows {:?} to {}", rows, meta.1);

            let join = tokio::spawn(async move {
                let mut stream = handle.lock().await;
                let exchange = dispatch_task(&mut *stream, &task);
                match timeout {
                    Some(limit) => match tokio::time::timeout(limit, exchange).await {
                        Ok(outcome) => outcome.map_err(TaskFailure::from),
                        Err(_) => Err(TaskFailure::TimedOut(limit)),
                    },
                    None => exchange.await.map_err(TaskFailure::from),
                }
            });
            self.in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(join.abort_handle());
            pending.push((meta, rows, join));
        }

        // Every exchange finishes (or fails) before anything is assembled
        let mut outcomes = Vec::with_capacity(pending.len());
        for ((id, address), rows, join) in pending {
            let outcome = match join.await {
                Ok(outcome) => outcome,
                Err(e) => Err(TaskFailure::Aborted(e.to_string())),
            };
            outcomes.push((id, address, rows, outcome));
        }
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|h| !h.is_finished());

        // Outcomes are in row order
        let mut returned = Vec::with_capacity(outcomes.len());
        let mut missing = Vec::new();
        let mut failed_handles = Vec::new();

        for (handle, address, rows, outcome) in outcomes {
            match outcome {
                Ok((block, duration_secs)) => {
                    debug!("Worker {} returned rows {:?} in {:.3}s", address, rows, duration_secs);
                    returned.push(TaskResult {
                        address,
                        rows,
                        block,
                        duration_secs,
                    });
                }
                Err(failure) => {
                    warn!("Worker {} failed rows {:?}: {}", address, rows, failure);
                    failed_handles.push(handle);
                    missing.push(MissingBlock {
                        address,
                        rows,
                        reason: failure.to_string(),
                    });
                }
            }
        }

        let stats: Vec<WorkerStat> = returned.iter().map(WorkerStat::from).collect();
        let elapsed = started.elapsed();
        if missing.is_empty() {
            let blocks: Vec<Matrix> = returned.into_iter().map(|r| r.block).collect();
            let result = Matrix::vstack(b.cols(), &blocks)?;
            info!("Round complete in {:.3}s", elapsed.as_secs_f64());
            Ok(RoundReport {
                result,
                stats,
                elapsed,
            })
        } else {
            let mut result = Matrix::zeros(a.rows(), b.cols());
            for task_result in &returned {
                result.write_rows(task_result.rows.start, &task_result.block)?;
            }
            for block in &missing {
                result.fill_rows(block.rows.clone(), f64::NAN);
            }
            Err(RoundError::PartialRoundFailure(Box::new(PartialRound {
                result,
                stats,
                missing,
                failed_handles,
                elapsed,
            })))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::registry::ConnectionRegistry;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::net::TcpStream;

    /// Minimal worker side of one exchange
    async fn serve_one(mut stream: DuplexStream, duration: f64) -> TaskHeader {
        let header = protocol::read_header(&mut stream).await.unwrap().unwrap();
        protocol::write_ack(&mut stream).await.unwrap();
        let (a, b) = protocol::read_operands(&mut stream, &header).await.unwrap();
        let product = a.multiply(&b).unwrap();
        let frame = protocol::encode_result(&product, duration);
        protocol::write_frame(&mut stream, &frame, &mut 0).await.unwrap();
        header
    }

    #[tokio::test]
    async fn test_dispatch_task_exchange() {
        let a = Arc::new(Matrix::from_rows(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![2.0, 2.0]]).unwrap());
        let b = Arc::new(Matrix::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap());
        let task = Task::new(1..3, a.clone(), b.clone());

        let (mut coordinator, worker) = duplex(64);
        let server = tokio::spawn(serve_one(worker, 0.5));

        let (block, duration) = dispatch_task(&mut coordinator, &task).await.unwrap();
        let header = server.await.unwrap();

        assert_eq!(header, TaskHeader::new(2, 2, 2, 3));
        assert_eq!(duration, 0.5);
        assert_eq!(block.shape(), (2, 3));
        assert_eq!(block.row(0), &[4.0, 5.0, 6.0]);
        assert_eq!(block.row(1), &[10.0, 14.0, 18.0]);
    }

    #[tokio::test]
    async fn test_dispatch_task_empty_block() {
        let a = Arc::new(Matrix::random(2, 3));
        let b = Arc::new(Matrix::random(3, 4));
        let task = Task::new(2..2, a, b);

        let (mut coordinator, worker) = duplex(1024);
        let server = tokio::spawn(serve_one(worker, 0.0));

        let (block, _) = dispatch_task(&mut coordinator, &task).await.unwrap();
        server.await.unwrap();
        assert_eq!(block.shape(), (0, 4));
    }

    #[tokio::test]
    async fn test_dispatch_task_peer_closes_mid_exchange() {
        let a = Arc::new(Matrix::random(4, 4));
        let b = Arc::new(Matrix::random(4, 4));
        let task = Task::new(0..4, a, b);

        let (mut coordinator, mut worker) = duplex(4096);
        let server = tokio::spawn(async move {
            let header = protocol::read_header(&mut worker).await.unwrap().unwrap();
            protocol::write_ack(&mut worker).await.unwrap();
            protocol::read_operands(&mut worker, &header).await.unwrap();
            // Dropping the stream closes it before any result bytes
        });

        let err = dispatch_task(&mut coordinator, &task).await.unwrap_err();
        server.await.unwrap();
        assert!(matches!(err, WireError::ShortRead { got: 0, .. }));
    }

    #[tokio::test]
    async fn test_no_workers_available() {
        let engine = DispatchEngine::new(None);
        let a = Arc::new(Matrix::random(4, 4));
        let b = Arc::new(Matrix::random(4, 4));

        let err = engine.run_round(a, b, &[]).await.unwrap_err();
        assert!(matches!(err, RoundError::NoWorkersAvailable));
    }

    #[tokio::test]
    async fn test_abort_in_flight_closes_worker_streams() {
        let registry = ConnectionRegistry::new();
        let addr = registry.start("127.0.0.1:0").await.unwrap();
        let mut stuck = TcpStream::connect(addr).await.unwrap();
        for _ in 0..200 {
            if registry.len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let handles = registry.current_handles();
        assert_eq!(handles.len(), 1);

        let engine = DispatchEngine::new(None);
        let round = tokio::spawn({
            let engine = engine.clone();
            async move {
                let a = Arc::new(Matrix::random(2, 2));
                let b = Arc::new(Matrix::random(2, 2));
                engine.run_round(a, b, &handles).await
            }
        });

        // Take the whole task, then never answer
        let header = protocol::read_header(&mut stuck).await.unwrap().unwrap();
        protocol::write_ack(&mut stuck).await.unwrap();
        protocol::read_operands(&mut stuck, &header).await.unwrap();

        assert_eq!(engine.abort_in_flight(), 1);
        registry.close_all();

        match round.await.unwrap() {
            Err(RoundError::PartialRoundFailure(partial)) => {
                assert_eq!(partial.missing.len(), 1);
                assert!(partial.missing[0].reason.contains("aborted"));
                assert!(partial.result.as_slice().iter().all(|v| v.is_nan()));
            }
            other => panic!("expected PartialRoundFailure, got {:?}", other.map(|r| r.stats)),
        }

        let mut byte = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), stuck.read(&mut byte))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, 0);
    }

    #[test]
    fn test_task_header_and_block() {
        let a = Arc::new(Matrix::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]]).unwrap());
        let b = Arc::new(Matrix::zeros(2, 7));
        let task = Task::new(1..3, a, b);

        assert_eq!(task.header(), TaskHeader::new(2, 2, 2, 7));
        assert_eq!(task.a_block(), &[3.0, 4.0, 5.0, 6.0]);
    }
}
