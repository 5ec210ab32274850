//! Protocol framing
//!
//! Each frame is a 4-byte big-endian length followed by a JSON
//! [`Envelope`]. Handshake messages travel on [`PROTOCOL_CHANNEL`]; other
//! channels of the same stream belong to replication and are rejected here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Channel number of trust handshakes
pub const PROTOCOL_CHANNEL: u32 = 1;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Unexpected channel {0}")]
    UnexpectedChannel(u32),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<M> {
    pub channel: u32,
    pub message: M,
}

/// Length-prefixed JSON framing over a byte stream
pub struct FramedStream<S> {
    stream: S,
    max_frame_size: usize,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S, max_frame_size: usize) -> Self {
        Self {
            stream,
            max_frame_size,
        }
    }

    pub async fn send<M: Serialize>(&mut self, message: &M) -> Result<(), WireError> {
        let bytes = serde_json::to_vec(&Envelope {
            channel: PROTOCOL_CHANNEL,
            message,
        })?;
        if bytes.len() > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: bytes.len(),
                limit: self.max_frame_size,
            });
        }

        // Frame the message: 4-byte length prefix + data
        self.stream.write_u32(bytes.len() as u32).await?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Next message, or `None` once the peer has closed the stream
    pub async fn recv<M: DeserializeOwned>(&mut self) -> Result<Option<M>, WireError> {
        let len = match self.stream.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: len,
                limit: self.max_frame_size,
            });
        }

        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).await?;
        let envelope: Envelope<M> = serde_json::from_slice(&buf)?;
        if envelope.channel != PROTOCOL_CHANNEL {
            return Err(WireError::UnexpectedChannel(envelope.channel));
        }
        Ok(Some(envelope.message))
    }

    /// Flush and release the underlying stream
    pub async fn shutdown(mut self) -> Result<(), WireError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
