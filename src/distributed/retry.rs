//! Bounded retry for frame writes
//!
//! Workers send a result frame with at most `1 + retries` attempts. The frame
//! is fully encoded before the first attempt, and each retry continues from the
//! first byte the transport has not accepted, so the peer never sees a byte twice.

use crate::distributed::protocol::{write_frame, WireError, WireResult};
use log::{debug, warn};
use std::time::Duration;
use tokio::io::AsyncWrite;

/// Retry count and delay between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one fails
    pub retries: u32,
    /// Fixed delay before each retry
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    /// One retry, immediately
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Total number of attempts this policy allows
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Write `frame` to `writer`, retrying on transport errors
    ///
    /// A retry resumes after the bytes already accepted. Returns the number of
    /// attempts used on success. When every attempt fails, returns
    /// `SendFailure` carrying the last transport error.
    pub async fn write_frame<W>(&self, writer: &mut W, frame: &[u8]) -> WireResult<u32>
    where
        W: AsyncWrite + Unpin,
    {
        let mut attempt = 0;
        let mut sent = 0;
        loop {
            attempt += 1;
            match write_frame(writer, frame, &mut sent).await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!("frame sent on attempt {}", attempt);
                    }
                    return Ok(attempt);
                }
                Err(e) if attempt < self.max_attempts() => {
                    warn!(
                        "send attempt {}/{} failed after {}/{} bytes: {}; retrying in {:?}",
                        attempt,
                        self.max_attempts(),
                        sent,
                        frame.len(),
                        e,
                        self.backoff
                    );
                    if !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                Err(e) => {
                    return Err(WireError::SendFailure {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}
