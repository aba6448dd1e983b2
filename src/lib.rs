//! dmatmul - Distributed dense matrix multiplication
//!
//! A coordinator splits the rows of A across connected workers, ships each
//! worker its row block plus all of B, and reassembles the partial products
//! in row order.
//!
//! # Architecture
//!
//! - **Discovery**: Workers find the coordinator through UDP broadcast
//! - **Wire protocol**: Text task header, one-byte ack, raw little-endian f64 payloads
//! - **Rounds**: Concurrent per-worker exchanges with a per-task timeout
//! - **Workers**: Reconnecting session, rayon-parallel compute, bounded result retry

pub mod config;
pub mod distributed;
pub mod matrix;
pub mod output;
pub mod partition;

// Re-export commonly used types
pub use config::Config;
pub use matrix::{Matrix, MatrixError};

/// Result type used throughout dmatmul
pub type Result<T> = anyhow::Result<T>;
