// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Vigil durable queue
//!
//! Store-and-forward buffer that holds signed envelopes while the broker is
//! unreachable or busy, and replays them oldest-first once it is not.
//!
//! # Features
//!
//! - **SQLite WAL backend** -- `journal_mode=WAL`, `synchronous=FULL`; every
//!   append is an atomic, durable commit
//! - **Idempotent append** -- one record per idempotency key, first write wins
//! - **Bounded backlog** -- oldest records evicted past `max_bytes`
//! - **Ordered drain** -- FIFO replay that halts on RETRY and counts transport
//!   failures per record
//!
//! # Example
//!
//! ```ignore
//! use vigil_queue::{DurableQueue, QueueConfig};
//!
//! let queue = DurableQueue::open("agent-queue.db", QueueConfig::default())?;
//! queue.append(&envelope)?;
//! let delivered = queue.drain(|env| client.publish(env), 100).await?;
//! ```

pub mod config;
pub mod sqlite;
pub mod stats;

pub use config::{QueueConfig, QueueConfigBuilder};
pub use sqlite::{DrainHalt, DrainReport, DurableQueue};
pub use stats::{QueueStats, QueueStatsSnapshot};

use thiserror::Error;

/// Queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("envelope encoding failed: {0}")]
    Encode(#[from] vigil::EnvelopeError),

    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),
}

/// One buffered envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRecord {
    /// FIFO position; strictly increasing, never reused
    pub sequence_id: i64,
    pub idempotency_key: String,
    pub enqueued_at_ns: u64,
    /// Exact bytes to resend
    pub serialized_bytes: Vec<u8>,
    /// Transport-level failures so far
    pub retry_count: u32,
}

impl QueueRecord {
    pub fn len(&self) -> usize {
        self.serialized_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.serialized_bytes.is_empty()
    }
}
