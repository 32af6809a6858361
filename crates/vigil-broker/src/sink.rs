// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Storage for accepted envelopes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use vigil::{Envelope, EnvelopeError};

/// Sink failures. The handler reports them as RETRY.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("encoding failed: {0}")]
    Encode(#[from] EnvelopeError),
}

/// Destination for envelopes the broker accepted.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn store(&self, envelope: &Envelope) -> Result<(), SinkError>;
}

/// Keeps everything in memory, without bound. Meant for tests and embedding;
/// the broker binary always stores to a [`JsonlSink`].
#[derive(Debug, Default)]
pub struct MemorySink {
    envelopes: Mutex<Vec<Envelope>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.envelopes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        self.envelopes
            .lock()
            .iter()
            .map(|e| e.idempotency_key.clone())
            .collect()
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes.lock().clone()
    }
}

#[async_trait]
impl EnvelopeSink for MemorySink {
    async fn store(&self, envelope: &Envelope) -> Result<(), SinkError> {
        self.envelopes.lock().push(envelope.clone());
        Ok(())
    }
}

/// Appends one JSON envelope per line.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        tracing::info!("storing accepted envelopes in {}", path.display());
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(tokio::fs::File::from_std(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EnvelopeSink for JsonlSink {
    async fn store(&self, envelope: &Envelope) -> Result<(), SinkError> {
        let mut line = envelope.to_bytes()?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
