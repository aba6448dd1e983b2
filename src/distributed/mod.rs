//! Distributed matrix multiplication
//!
//! # Architecture
//!
//! dmatmul uses a coordinator-worker architecture:
//!
//! - **Coordinator**: Owns both operands, partitions rows of A, dispatches one task
//!   per connected worker and reassembles the result in row order
//! - **Worker**: Receives a row block of A plus all of B, multiplies, and returns
//!   the block with its own compute time
//!
//! Workers find the coordinator through UDP broadcast announcements unless they
//! are given its address.
//!
//! # Modules
//!
//! - `protocol`: Task header, acknowledgement and binary payload framing
//! - `retry`: Bounded retry for result frames
//! - `discovery`: Broadcast announcer and one-shot listener
//! - `registry`: Live worker connections on the coordinator
//! - `dispatch`: One round of fan-out and aggregation
//! - `coordinator`: Coordinator facade (arming, rounds, stats)
//! - `worker_session`: Worker state machine

pub mod coordinator;
pub mod discovery;
pub mod dispatch;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod worker_session;

// Re-export key types
pub use coordinator::Coordinator;
pub use dispatch::{
    DispatchEngine,
    MissingBlock,
    PartialRound,
    RoundError,
    RoundReport,
    WorkerStat,
};
pub use protocol::{TaskHeader, WireError, ACK};
pub use registry::{ConnectionRegistry, RegistryEvent, WorkerHandle};
pub use retry::RetryPolicy;
pub use worker_session::{ServeOutcome, SessionSettings, SessionState, WorkerSession};
