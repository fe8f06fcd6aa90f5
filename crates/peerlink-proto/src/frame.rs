//! Length-prefixed framing for replication messages on byte streams.
//!
//! Each frame is a 4-byte big-endian body length followed by the JSON body.
//! Zero-length frames are invalid; frames larger than `max_frame_bytes` are
//! rejected before the body is read.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ReplicationMessage;

/// Size of the length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Errors produced while reading or writing frames
#[derive(Debug, Error)]
pub enum FrameError {
    /// Underlying I/O failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The length prefix was unusable
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid {
        /// What was wrong with the length
        reason: String,
    },
    /// The frame exceeds the configured bound
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        /// Configured bound
        max_frame_bytes: usize,
        /// Size that was announced or attempted
        got_bytes: usize,
    },
    /// The body was not a valid message
    #[error("invalid message: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Reads messages from an async byte stream
pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a reader
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Read the next frame body, or `None` on a clean end of stream
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.reader.read(&mut header[read..]).await?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame header truncated",
                )
                .into());
            }
            read += n;
        }

        let length = u32::from_be_bytes(header) as usize;
        if length == 0 {
            return Err(FrameError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body).await?;
        Ok(Some(body))
    }

    /// Read and decode the next message, or `None` on a clean end of stream
    pub async fn read_message(&mut self) -> Result<Option<ReplicationMessage>, FrameError> {
        match self.read_frame().await? {
            Some(body) => Ok(Some(ReplicationMessage::decode(&body)?)),
            None => Ok(None),
        }
    }
}

/// Writes messages to an async byte stream
pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writer
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    /// Write one frame and flush; returns the bytes written
    pub async fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(frame.len())
    }

    /// Encode and write one message
    pub async fn write_message(&mut self, message: &ReplicationMessage) -> Result<usize, FrameError> {
        let body = message.encode()?;
        self.write_frame(&body).await
    }

    /// Shut down the write half
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Prefix `payload` with its length, enforcing the bound
pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::FrameLengthInvalid {
            reason: "frame length cannot be zero".to_string(),
        });
    }
    if payload.len() > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::FrameLengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}
