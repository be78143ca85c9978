//! Frame protocol between the host and `sandbox-worker` processes
//!
//! Each frame is a 4-byte big-endian length (covering the type byte and the
//! payload), a 1-byte message type and a JSON payload.

use std::io;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ExecutionFailure;
use crate::sandbox::wasm::{GuestLogLevel, GuestOutcome};

/// Upper bound on a single frame
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Message types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    // Host → worker
    Execute = 1,
    Shutdown = 2,

    // Worker → host
    Ready = 10,
    Log = 11,
    Result = 12,
}

impl TryFrom<u8> for FrameKind {
    type Error = io::Error;

    fn try_from(value: u8) -> io::Result<Self> {
        match value {
            1 => Ok(Self::Execute),
            2 => Ok(Self::Shutdown),
            10 => Ok(Self::Ready),
            11 => Ok(Self::Log),
            12 => Ok(Self::Result),
            other => Err(invalid(format!("unknown frame type {other}"))),
        }
    }
}

/// A single frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn empty(kind: FrameKind) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    /// Frame with a JSON payload
    pub fn json<T: Serialize>(kind: FrameKind, value: &T) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            payload: serde_json::to_vec(value)?,
        })
    }

    /// Parse payload as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// `Log` frame payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: GuestLogLevel,
    pub message: String,
}

/// `Result` frame payload
pub type ExecuteReply = Result<GuestOutcome, ExecutionFailure>;

/// Write one frame and flush.
///
/// # Errors
///
/// I/O errors from the writer, or `InvalidInput` for oversized payloads.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body_len = frame.payload.len() + 1;
    if body_len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {body_len} bytes exceeds limit"),
        ));
    }
    let len = u32::try_from(body_len).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&[frame.kind as u8]).await?;
    writer.write_all(&frame.payload).await?;
    writer.flush().await
}

/// Read one frame; `None` on a clean end of stream.
///
/// # Errors
///
/// I/O errors, truncated frames, unknown types or oversized lengths.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = usize::try_from(u32::from_be_bytes(len_buf)).map_err(|e| invalid(e.to_string()))?;
    if len == 0 {
        return Err(invalid("empty frame".to_string()));
    }
    if len > MAX_FRAME_LEN {
        return Err(invalid(format!("frame of {len} bytes exceeds limit")));
    }

    let kind = FrameKind::try_from(reader.read_u8().await?)?;
    let mut payload = vec![0u8; len - 1];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame { kind, payload }))
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}
