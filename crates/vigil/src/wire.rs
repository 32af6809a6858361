// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent <-> broker wire protocol.
//!
//! Length-prefixed JSON frames over any byte stream (plain TCP or TLS):
//!
//! ```text
//! +----------------+-------------------+
//! | Length (4B BE) | JSON frame        |
//! +----------------+-------------------+
//! ```
//!
//! One request frame (`publish`) is answered by exactly one `ack` frame on
//! the same connection.

use crate::ack::PublishAck;
use crate::envelope::Envelope;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default maximum frame size (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Wire frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Frame {
    /// Agent publishes one envelope.
    Publish(Envelope),
    /// Broker answers a publish.
    Ack(PublishAck),
}

/// Wire errors.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("empty frame")]
    EmptyFrame,

    #[error("frame too large: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A framed, bidirectional connection.
pub struct FramedStream<S> {
    stream: S,
    max_frame_size: usize,
    read_buffer: Vec<u8>,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, max_frame_size: usize) -> Self {
        Self {
            stream,
            max_frame_size,
            read_buffer: Vec::with_capacity(4096),
        }
    }

    /// Read the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the connection between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, WireError> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Err(WireError::EmptyFrame);
        }
        if len > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        self.read_buffer.clear();
        self.read_buffer.resize(len, 0);
        self.stream.read_exact(&mut self.read_buffer).await?;

        Ok(Some(serde_json::from_slice(&self.read_buffer)?))
    }

    /// Write one frame and flush.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), WireError> {
        let body = serde_json::to_vec(frame)?;
        if body.len() > self.max_frame_size {
            return Err(WireError::FrameTooLarge {
                size: body.len(),
                max: self.max_frame_size,
            });
        }

        self.stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .await?;
        self.stream.write_all(&body).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write half.
    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }
}
