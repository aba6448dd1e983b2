//! Task wire protocol
//!
//! This module defines the byte-level exchange between the coordinator and a
//! worker for one task. Binary payloads carry no length prefix: every length is
//! derived from the task header that was exchanged first.
//!
//! # Message Flow
//!
//! ```text
//! Coordinator                          Worker
//!     |                                  |
//!     |-- HEADER "aR,aC,bR,bC\n" ------->|
//!     |<------------------- ACK (0x06) --|
//!     |-- A block (aR*aC f64) ---------->|
//!     |-- B (bR*bC f64) ---------------->|
//!     |                                  |  compute A * B
//!     |<------ RESULT (aR*bC f64) -------|
//!     |<------ DURATION (1 f64, secs) ---|
//! ```
//!
//! # Encoding
//!
//! - The header is UTF-8 text terminated by `\n`. Receivers accumulate bytes
//!   until the terminator, so a header split across reads parses correctly.
//! - All floats are IEEE-754 binary64, little-endian, row-major.

use crate::matrix::{Matrix, MatrixError};
use std::fmt;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Acknowledgement byte sent by the worker after it has parsed a header
pub const ACK: u8 = 0x06;

/// Header terminator
pub const HEADER_TERMINATOR: u8 = b'\n';

/// Longest accepted header, terminator included
pub const MAX_HEADER_LEN: usize = 64;

/// Size of one encoded value
pub const F64_LEN: usize = std::mem::size_of::<f64>();

/// Floats encoded per write call
const WRITE_CHUNK_VALUES: usize = 8192;

/// Wire codec errors
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Header text had the wrong token count, a non-numeric token or
    /// non-conforming shapes
    #[error("malformed task header {header:?}: {reason}")]
    HeaderParse { header: String, reason: String },

    /// The peer closed the stream before an exact-length read completed
    #[error("short read: expected {expected} bytes, got {got} before the peer closed")]
    ShortRead { expected: usize, got: usize },

    #[error("unexpected acknowledgement byte 0x{0:02x}")]
    UnexpectedAck(u8),

    /// Writing a result failed on every attempt
    #[error("failed to send result after {attempts} attempt(s)")]
    SendFailure {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Matrix(#[from] MatrixError),

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl WireError {
    fn header(header: &str, reason: impl Into<String>) -> Self {
        Self::HeaderParse {
            header: header.to_string(),
            reason: reason.into(),
        }
    }
}

pub type WireResult<T> = std::result::Result<T, WireError>;

/// Shapes of the two operands of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHeader {
    pub a_rows: usize,
    pub a_cols: usize,
    pub b_rows: usize,
    pub b_cols: usize,
}

impl TaskHeader {
    pub fn new(a_rows: usize, a_cols: usize, b_rows: usize, b_cols: usize) -> Self {
        Self {
            a_rows,
            a_cols,
            b_rows,
            b_cols,
        }
    }

    /// Encode as a terminated text frame
    pub fn encode(&self) -> Vec<u8> {
        format!("{self}\n").into_bytes()
    }

    /// Parse header text, with or without its terminator
    pub fn parse(text: &str) -> WireResult<Self> {
        let body = text.trim_end_matches(['\n', '\r']);
        let tokens: Vec<&str> = body.split(',').map(str::trim).collect();
        if tokens.len() != 4 {
            return Err(WireError::header(
                text,
                format!("expected 4 fields, found {}", tokens.len()),
            ));
        }

        let mut dims = [0usize; 4];
        for (dim, token) in dims.iter_mut().zip(&tokens) {
            *dim = token
                .parse()
                .map_err(|_| WireError::header(text, format!("field {token:?} is not a non-negative integer")))?;
        }

        let header = Self::new(dims[0], dims[1], dims[2], dims[3]);
        if header.a_cols != header.b_rows {
            return Err(WireError::header(
                text,
                format!(
                    "inner dimensions differ ({} columns vs {} rows)",
                    header.a_cols, header.b_rows
                ),
            ));
        }
        if header.task_bytes().is_none() {
            return Err(WireError::header(text, "payload size overflows"));
        }

        Ok(header)
    }

    /// Byte length of the A block payload
    pub fn a_bytes(&self) -> Option<usize> {
        self.a_rows.checked_mul(self.a_cols)?.checked_mul(F64_LEN)
    }

    /// Byte length of the B payload
    pub fn b_bytes(&self) -> Option<usize> {
        self.b_rows.checked_mul(self.b_cols)?.checked_mul(F64_LEN)
    }

    /// Byte length of the result payload, excluding the duration
    pub fn result_bytes(&self) -> Option<usize> {
        self.a_rows.checked_mul(self.b_cols)?.checked_mul(F64_LEN)
    }

    /// Bytes a worker holds for this task: both operands plus the result
    pub fn task_bytes(&self) -> Option<usize> {
        self.a_bytes()?
            .checked_add(self.b_bytes()?)?
            .checked_add(self.result_bytes()?)
    }

    /// Reject a task larger than `limit` bytes
    pub fn ensure_within(&self, limit: usize) -> WireResult<()> {
        match self.task_bytes() {
            Some(bytes) if bytes <= limit => Ok(()),
            Some(bytes) => Err(WireError::header(
                &self.to_string(),
                format!("task needs {bytes} bytes, limit is {limit}"),
            )),
            None => Err(WireError::header(&self.to_string(), "payload size overflows")),
        }
    }
}

impl fmt::Display for TaskHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{},{}", self.a_rows, self.a_cols, self.b_rows, self.b_cols)
    }
}

/// Fill `buf` completely from `reader`
///
/// Accumulates across as many reads as the stream needs. A zero-length read
/// means the peer closed and ends the loop with `ShortRead`.
pub async fn read_exact_len<R>(reader: &mut R, buf: &mut [u8]) -> WireResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(WireError::ShortRead {
                expected: buf.len(),
                got: filled,
            });
        }
        filled += n;
    }
    Ok(())
}

/// Read one task header
///
/// Returns `Ok(None)` when the peer closed the stream cleanly before sending
/// any header byte. A close after a partial header is a `ShortRead`.
pub async fn read_header<R>(reader: &mut R) -> WireResult<Option<TaskHeader>>
where
    R: AsyncRead + Unpin,
{
    let mut raw = Vec::with_capacity(32);
    let mut byte = [0u8; 1];

    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if raw.is_empty() {
                return Ok(None);
            }
            // At least the terminator was still owed
            return Err(WireError::ShortRead {
                expected: raw.len() + 1,
                got: raw.len(),
            });
        }

        raw.push(byte[0]);
        if byte[0] == HEADER_TERMINATOR {
            break;
        }
        if raw.len() >= MAX_HEADER_LEN {
            return Err(WireError::header(
                &String::from_utf8_lossy(&raw),
                format!("no terminator within {MAX_HEADER_LEN} bytes"),
            ));
        }
    }

    let text = std::str::from_utf8(&raw)
        .map_err(|_| WireError::header(&String::from_utf8_lossy(&raw), "not valid UTF-8"))?;
    TaskHeader::parse(text).map(Some)
}

/// Send a task header
pub async fn write_header<W>(writer: &mut W, header: &TaskHeader) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&header.encode()).await?;
    writer.flush().await?;
    Ok(())
}

/// Send the header acknowledgement
pub async fn write_ack<W>(writer: &mut W) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[ACK]).await?;
    writer.flush().await?;
    Ok(())
}

/// Wait for the header acknowledgement
pub async fn read_ack<R>(reader: &mut R) -> WireResult<()>
where
    R: AsyncRead + Unpin,
{
    let mut byte = [0u8; 1];
    read_exact_len(reader, &mut byte).await?;
    if byte[0] != ACK {
        return Err(WireError::UnexpectedAck(byte[0]));
    }
    Ok(())
}

/// Write values as little-endian binary64, without any framing
pub async fn write_f64s<W>(writer: &mut W, values: &[f64]) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(values.len().min(WRITE_CHUNK_VALUES) * F64_LEN);
    for chunk in values.chunks(WRITE_CHUNK_VALUES) {
        buf.clear();
        for value in chunk {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        writer.write_all(&buf).await?;
    }
    Ok(())
}

/// Read exactly `count` little-endian binary64 values
pub async fn read_f64s<R>(reader: &mut R, count: usize) -> WireResult<Vec<f64>>
where
    R: AsyncRead + Unpin,
{
    let len = count.checked_mul(F64_LEN).ok_or_else(payload_overflow)?;
    let mut raw = Vec::new();
    raw.try_reserve_exact(len).map_err(|e| {
        WireError::Io(io::Error::new(
            io::ErrorKind::OutOfMemory,
            format!("cannot allocate {len} byte payload: {e}"),
        ))
    })?;
    raw.resize(len, 0);
    read_exact_len(reader, &mut raw).await?;
    Ok(decode_f64s(&raw))
}

fn payload_overflow() -> WireError {
    WireError::Io(io::Error::new(io::ErrorKind::InvalidInput, "payload size overflows"))
}

fn decode_f64s(raw: &[u8]) -> Vec<f64> {
    raw.chunks_exact(F64_LEN)
        .map(|chunk| {
            let mut bytes = [0u8; F64_LEN];
            bytes.copy_from_slice(chunk);
            f64::from_le_bytes(bytes)
        })
        .collect()
}

/// Read a `rows` x `cols` matrix payload
pub async fn read_matrix<R>(reader: &mut R, rows: usize, cols: usize) -> WireResult<Matrix>
where
    R: AsyncRead + Unpin,
{
    let count = rows.checked_mul(cols).ok_or_else(payload_overflow)?;
    let data = read_f64s(reader, count).await?;
    Ok(Matrix::new(rows, cols, data)?)
}

/// Read the A block and B operand described by `header`
pub async fn read_operands<R>(reader: &mut R, header: &TaskHeader) -> WireResult<(Matrix, Matrix)>
where
    R: AsyncRead + Unpin,
{
    let a = read_matrix(reader, header.a_rows, header.a_cols).await?;
    let b = read_matrix(reader, header.b_rows, header.b_cols).await?;
    Ok((a, b))
}

/// Build the complete result frame: result values then the duration
///
/// The frame is built once so that a retried send writes identical bytes.
pub fn encode_result(result: &Matrix, duration_secs: f64) -> Vec<u8> {
    let mut frame = Vec::with_capacity((result.as_slice().len() + 1) * F64_LEN);
    for value in result.as_slice() {
        frame.extend_from_slice(&value.to_le_bytes());
    }
    frame.extend_from_slice(&duration_secs.to_le_bytes());
    frame
}

/// Write the unsent tail of a pre-encoded frame and flush it
///
/// `sent` counts bytes the transport has accepted and is updated as the write
/// progresses, including when it fails. Calling again with the same counter
/// resumes the frame rather than restarting it.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8], sent: &mut usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while *sent < frame.len() {
        let n = writer.write(&frame[*sent..]).await?;
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        *sent += n;
    }
    writer.flush().await
}

/// Read a result block of `rows` x `cols` followed by the worker's duration
pub async fn read_result<R>(reader: &mut R, rows: usize, cols: usize) -> WireResult<(Matrix, f64)>
where
    R: AsyncRead + Unpin,
{
    let result = read_matrix(reader, rows, cols).await?;
    let mut duration = [0u8; F64_LEN];
    read_exact_len(reader, &mut duration).await?;
    Ok((result, f64::from_le_bytes(duration)))
}
