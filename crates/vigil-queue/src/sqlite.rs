// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! SQLite-backed durable queue
//!
//! Thread-safe via an internal mutex around the connection (SQLite
//! `Connection` is not `Sync`). Drain cycles are additionally serialized by
//! an async mutex so two drainers never replay the same record.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE envelopes (
//!     sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     idempotency_key TEXT NOT NULL UNIQUE,
//!     enqueued_at_ns INTEGER NOT NULL,
//!     serialized_bytes BLOB NOT NULL,
//!     retry_count INTEGER NOT NULL DEFAULT 0
//! );
//! ```

use crate::config::QueueConfig;
use crate::stats::{QueueStats, QueueStatsSnapshot};
use crate::{QueueError, QueueRecord};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::future::Future;
use std::path::Path;
use vigil::{AckStatus, Envelope, PublishAck};

/// Why a drain cycle stopped before exhausting its batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainHalt {
    /// Broker asked us to back off.
    Retry { backoff_hint_ms: u64 },
    /// The publish function failed at the transport level.
    Transport { error: String },
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Records acknowledged OK and removed
    pub delivered: usize,
    /// Records removed after INVALID/ERROR or exhausted retries
    pub dropped: usize,
    /// Records removed because their bytes no longer decode
    pub corrupt: usize,
    pub halted: Option<DrainHalt>,
}

impl DrainReport {
    /// True when the cycle touched nothing and did not halt.
    pub fn is_idle(&self) -> bool {
        self.delivered == 0 && self.dropped == 0 && self.corrupt == 0 && self.halted.is_none()
    }
}

struct Inner {
    conn: Connection,
    backlog_bytes: u64,
    depth: usize,
}

/// Durable FIFO of serialized envelopes.
pub struct DurableQueue {
    inner: Mutex<Inner>,
    drain_lock: tokio::sync::Mutex<()>,
    config: QueueConfig,
    stats: QueueStats,
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("config", &self.config)
            .field("depth", &self.size())
            .field("backlog_bytes", &self.backlog_bytes())
            .finish()
    }
}

impl DurableQueue {
    /// Open or create the queue file, recovering any existing records.
    pub fn open(path: impl AsRef<Path>, config: QueueConfig) -> Result<Self, QueueError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let queue = Self::with_connection(conn, config)?;
        tracing::info!(
            "opened queue at {} ({} records, {} bytes)",
            path.display(),
            queue.size(),
            queue.backlog_bytes()
        );
        Ok(queue)
    }

    /// In-memory queue (for testing)
    pub fn open_in_memory(config: QueueConfig) -> Result<Self, QueueError> {
        Self::with_connection(Connection::open_in_memory()?, config)
    }

    fn with_connection(conn: Connection, config: QueueConfig) -> Result<Self, QueueError> {
        config.validate()?;
        init_schema(&conn, &config)?;

        let (depth, backlog_bytes): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(length(serialized_bytes)), 0) FROM envelopes",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let stats = QueueStats::default();
        let mut inner = Inner {
            conn,
            backlog_bytes: backlog_bytes.max(0) as u64,
            depth: depth.max(0) as usize,
        };

        // The budget may have shrunk since the file was written.
        if inner.backlog_bytes > config.max_bytes {
            let tx = inner.conn.transaction()?;
            let (evicted, freed) = enforce_backlog(&tx, inner.backlog_bytes, config.max_bytes)?;
            tx.commit()?;
            inner.backlog_bytes -= freed;
            inner.depth -= evicted;
            for _ in 0..evicted {
                stats.evicted();
            }
        }

        Ok(Self {
            inner: Mutex::new(inner),
            drain_lock: tokio::sync::Mutex::new(()),
            config,
            stats,
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Append an envelope. Returns `false` if its idempotency key is
    /// already queued (the stored record is left untouched).
    pub fn append(&self, envelope: &Envelope) -> Result<bool, QueueError> {
        let bytes = envelope.to_bytes()?;
        self.append_bytes(&envelope.idempotency_key, &bytes)
    }

    fn append_bytes(&self, key: &str, bytes: &[u8]) -> Result<bool, QueueError> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let tx = inner.conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO envelopes (idempotency_key, enqueued_at_ns, serialized_bytes)
             VALUES (?1, ?2, ?3)",
            params![key, vigil::now_ns().min(i64::MAX as u64) as i64, bytes],
        )?;
        if inserted == 0 {
            drop(tx);
            self.stats.duplicate();
            tracing::debug!("queue: duplicate key {} ignored", key);
            return Ok(false);
        }

        let backlog = inner.backlog_bytes + bytes.len() as u64;
        let (evicted, freed) = enforce_backlog(&tx, backlog, self.config.max_bytes)?;
        tx.commit()?;

        inner.backlog_bytes = backlog - freed;
        inner.depth = inner.depth + 1 - evicted;
        self.stats.appended();
        for _ in 0..evicted {
            self.stats.evicted();
        }
        Ok(true)
    }

    /// Total serialized bytes currently queued.
    pub fn backlog_bytes(&self) -> u64 {
        self.inner.lock().backlog_bytes
    }

    /// Number of queued records.
    pub fn size(&self) -> usize {
        self.inner.lock().depth
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Oldest `limit` records, without removing them.
    pub fn peek(&self, limit: usize) -> Result<Vec<QueueRecord>, QueueError> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT sequence_id, idempotency_key, enqueued_at_ns, serialized_bytes, retry_count
             FROM envelopes
             ORDER BY sequence_id ASC
             LIMIT ?1",
        )?;
        let records = stmt
            .query_map([limit.min(i64::MAX as usize) as i64], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Remove every record. Returns how many were removed.
    pub fn clear(&self) -> Result<usize, QueueError> {
        let mut inner = self.inner.lock();
        let removed = inner.conn.execute("DELETE FROM envelopes", [])?;
        inner.backlog_bytes = 0;
        inner.depth = 0;
        tracing::info!("queue cleared ({} records)", removed);
        Ok(removed)
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        let (depth, backlog) = {
            let inner = self.inner.lock();
            (inner.depth, inner.backlog_bytes)
        };
        self.stats.snapshot(depth, backlog)
    }

    /// Replay up to `limit` records oldest-first through `publish`.
    ///
    /// Returns the number of records delivered. See [`DurableQueue::drain_report`].
    pub async fn drain<F, Fut, E>(&self, publish: F, limit: usize) -> Result<usize, QueueError>
    where
        F: FnMut(Envelope) -> Fut,
        Fut: Future<Output = Result<PublishAck, E>>,
        E: std::fmt::Display,
    {
        Ok(self.drain_report(publish, limit).await?.delivered)
    }

    /// Replay up to `limit` records oldest-first through `publish`.
    ///
    /// - OK: record removed, continue.
    /// - RETRY: stop; this record and everything after it stay queued.
    /// - INVALID / ERROR: record removed as dropped, continue.
    /// - `Err` from `publish`: the record's retry count is bumped and the
    ///   cycle stops. Once the count reaches `max_retries` the record is
    ///   dropped instead of kept.
    /// - Undecodable stored bytes: record removed as corrupt, continue.
    pub async fn drain_report<F, Fut, E>(
        &self,
        mut publish: F,
        limit: usize,
    ) -> Result<DrainReport, QueueError>
    where
        F: FnMut(Envelope) -> Fut,
        Fut: Future<Output = Result<PublishAck, E>>,
        E: std::fmt::Display,
    {
        let _drain = self.drain_lock.lock().await;
        let mut report = DrainReport::default();
        if limit == 0 {
            return Ok(report);
        }

        for record in self.peek(limit)? {
            let envelope = match Envelope::from_bytes(&record.serialized_bytes) {
                Ok(env) => env,
                Err(e) => {
                    tracing::warn!(
                        "queue: dropping corrupt record #{} ({}): {}",
                        record.sequence_id,
                        record.idempotency_key,
                        e
                    );
                    self.remove(&record)?;
                    self.stats.corrupt();
                    report.corrupt += 1;
                    continue;
                }
            };

            match publish(envelope).await {
                Ok(ack) => match ack.status {
                    AckStatus::Ok => {
                        self.remove(&record)?;
                        self.stats.delivered();
                        report.delivered += 1;
                    }
                    AckStatus::Retry => {
                        tracing::debug!(
                            "queue: broker busy at #{} (hint {} ms), halting drain",
                            record.sequence_id,
                            ack.backoff_hint_ms
                        );
                        report.halted = Some(DrainHalt::Retry {
                            backoff_hint_ms: ack.backoff_hint_ms,
                        });
                        break;
                    }
                    AckStatus::Invalid | AckStatus::Error => {
                        tracing::warn!(
                            "queue: broker rejected {} ({}): {}",
                            record.idempotency_key,
                            ack.status,
                            ack.reason
                        );
                        self.remove(&record)?;
                        self.stats.dropped();
                        report.dropped += 1;
                    }
                },
                Err(e) => {
                    let attempts = record.retry_count.saturating_add(1);
                    self.stats.retried();
                    if attempts >= self.config.max_retries {
                        tracing::warn!(
                            "queue: dropping {} after {} failed attempts: {}",
                            record.idempotency_key,
                            attempts,
                            e
                        );
                        self.remove(&record)?;
                        self.stats.dropped();
                        report.dropped += 1;
                    } else {
                        tracing::debug!(
                            "queue: attempt {}/{} for {} failed: {}",
                            attempts,
                            self.config.max_retries,
                            record.idempotency_key,
                            e
                        );
                        self.set_retry_count(record.sequence_id, attempts)?;
                    }
                    report.halted = Some(DrainHalt::Transport {
                        error: e.to_string(),
                    });
                    break;
                }
            }
        }

        Ok(report)
    }

    fn remove(&self, record: &QueueRecord) -> Result<(), QueueError> {
        let mut inner = self.inner.lock();
        let removed = inner.conn.execute(
            "DELETE FROM envelopes WHERE sequence_id = ?1",
            [record.sequence_id],
        )?;
        // Zero when an append evicted it mid-cycle.
        if removed == 1 {
            inner.backlog_bytes = inner.backlog_bytes.saturating_sub(record.len() as u64);
            inner.depth = inner.depth.saturating_sub(1);
        }
        Ok(())
    }

    fn set_retry_count(&self, sequence_id: i64, retry_count: u32) -> Result<(), QueueError> {
        let inner = self.inner.lock();
        inner.conn.execute(
            "UPDATE envelopes SET retry_count = ?2 WHERE sequence_id = ?1",
            params![sequence_id, retry_count],
        )?;
        Ok(())
    }
}

fn init_schema(conn: &Connection, config: &QueueConfig) -> Result<(), QueueError> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    tracing::debug!("queue journal_mode={}", mode);
    conn.pragma_update(None, "synchronous", "FULL")?;
    conn.busy_timeout(config.busy_timeout())?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS envelopes (
            sequence_id INTEGER PRIMARY KEY AUTOINCREMENT,
            idempotency_key TEXT NOT NULL UNIQUE,
            enqueued_at_ns INTEGER NOT NULL,
            serialized_bytes BLOB NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    Ok(())
}

/// Delete oldest records until `backlog <= max_bytes`.
///
/// Returns `(records_evicted, bytes_freed)`.
fn enforce_backlog(
    conn: &Connection,
    mut backlog: u64,
    max_bytes: u64,
) -> Result<(usize, u64), QueueError> {
    let mut evicted = 0usize;
    let mut freed = 0u64;

    while backlog > max_bytes {
        let oldest: Option<(i64, String, i64)> = conn
            .query_row(
                "SELECT sequence_id, idempotency_key, length(serialized_bytes)
                 FROM envelopes
                 ORDER BY sequence_id ASC
                 LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((sequence_id, key, len)) = oldest else {
            break;
        };

        conn.execute("DELETE FROM envelopes WHERE sequence_id = ?1", [sequence_id])?;
        let len = len.max(0) as u64;
        backlog = backlog.saturating_sub(len);
        freed += len;
        evicted += 1;
        tracing::warn!(
            "queue over budget: evicted #{} ({}, {} bytes)",
            sequence_id,
            key,
            len
        );
    }

    Ok((evicted, freed))
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<QueueRecord> {
    Ok(QueueRecord {
        sequence_id: row.get(0)?,
        idempotency_key: row.get(1)?,
        enqueued_at_ns: row.get::<_, i64>(2)?.max(0) as u64,
        serialized_bytes: row.get(3)?,
        retry_count: row.get::<_, i64>(4)?.clamp(0, u32::MAX as i64) as u32,
    })
}
