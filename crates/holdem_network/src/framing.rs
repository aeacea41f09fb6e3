//! Length-prefixed framing over a bidirectional byte stream.
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 big-endian    |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does not include the prefix itself. A zero-length frame is valid
//! and is used as a keep-alive; receivers skip it.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetworkError;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default cap on a single frame's payload (4 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Errors that can occur while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds the configured maximum.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    TooLarge { size: usize, max: usize },

    /// The stream ended cleanly on a frame boundary.
    #[error("connection closed")]
    Closed,

    /// Any other I/O failure, including a stream that ends mid-frame.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FrameError> for NetworkError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { size, max } => NetworkError::FrameTooLarge { size, max },
            FrameError::Closed => NetworkError::ConnectionClosed,
            FrameError::Io(e) => NetworkError::from(e),
        }
    }
}

/// Write one frame and flush.
///
/// A failure leaves the stream in an undefined state; callers must treat it
/// as fatal to the connection.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max,
        });
    }
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        size: payload.len(),
        max: u32::MAX as usize,
    })?;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame, blocking until the prefix and the whole payload arrived.
///
/// Returns [`FrameError::Closed`] only when the stream ends before the first
/// prefix byte; an end of stream anywhere else is an I/O error.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    if reader.read(&mut len_buf[..1]).await? == 0 {
        return Err(FrameError::Closed);
    }
    reader.read_exact(&mut len_buf[1..]).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(FrameError::TooLarge { size: len, max });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
