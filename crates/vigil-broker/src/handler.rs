// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish request handling.
//!
//! ```text
//! validate --bad--> INVALID
//!    |
//! admit ---full---> RETRY (hint)
//!    |
//! verify --fail---> ERROR "signature verification failed"
//!    |
//! age -----old----> ERROR "envelope too old"
//!    |
//! dedup ---seen---> OK "duplicate"
//!    |
//! store ---fail---> RETRY (hint)
//!    |
//!    +------------> OK "accepted"
//! ```

use crate::admission::AdmissionController;
use crate::sink::EnvelopeSink;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vigil::signing::PUBLIC_KEY_LEN;
use vigil::{now_ns, verify_envelope, Envelope, PublishAck};

/// Handler settings.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Any one of these may have signed an envelope. Empty skips verification.
    pub trusted_keys: Vec<[u8; PUBLIC_KEY_LEN]>,
    pub max_envelope_age: Option<Duration>,
    pub dedup_capacity: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            trusted_keys: Vec::new(),
            max_envelope_age: None,
            dedup_capacity: 100_000,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    invalid: AtomicU64,
    retried: AtomicU64,
    bad_signature: AtomicU64,
    too_old: AtomicU64,
    sink_failures: AtomicU64,
}

/// Handler counters snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HandlerStats {
    pub accepted: u64,
    pub duplicates: u64,
    pub invalid: u64,
    pub retried: u64,
    pub bad_signature: u64,
    pub too_old: u64,
    pub sink_failures: u64,
}

/// Turns one publish request into one ack.
pub struct PublishHandler {
    admission: Arc<AdmissionController>,
    sink: Arc<dyn EnvelopeSink>,
    trusted_keys: Vec<[u8; PUBLIC_KEY_LEN]>,
    max_envelope_age: Option<Duration>,
    dedup: Mutex<LruCache<String, ()>>,
    counters: Counters,
}

impl std::fmt::Debug for PublishHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishHandler")
            .field("admission", &self.admission)
            .field("trusted_keys", &self.trusted_keys.len())
            .field("max_envelope_age", &self.max_envelope_age)
            .finish_non_exhaustive()
    }
}

impl PublishHandler {
    pub fn new(
        admission: Arc<AdmissionController>,
        sink: Arc<dyn EnvelopeSink>,
        config: HandlerConfig,
    ) -> Self {
        if config.trusted_keys.is_empty() {
            tracing::warn!("no trusted keys configured; envelope signatures are NOT verified");
        }
        let capacity = NonZeroUsize::new(config.dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            admission,
            sink,
            trusted_keys: config.trusted_keys,
            max_envelope_age: config.max_envelope_age,
            dedup: Mutex::new(LruCache::new(capacity)),
            counters: Counters::default(),
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Toggle drill mode.
    pub fn set_overload(&self, enabled: bool) {
        self.admission.set_overload(enabled);
    }

    pub async fn handle_publish(&self, envelope: &Envelope) -> PublishAck {
        if let Err(reason) = envelope.validate() {
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("invalid envelope: {}", reason);
            return PublishAck::invalid(reason);
        }

        let _permit = match self.admission.try_admit() {
            Ok(permit) => permit,
            Err(rejected) => {
                self.counters.retried.fetch_add(1, Ordering::Relaxed);
                return PublishAck::retry(rejected.reason.as_str(), rejected.backoff_hint_ms);
            }
        };

        if !self.signature_trusted(envelope) {
            self.counters.bad_signature.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "signature verification failed for {}",
                envelope.idempotency_key
            );
            return PublishAck::error("signature verification failed");
        }

        if self.is_too_old(envelope) {
            self.counters.too_old.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("envelope {} too old", envelope.idempotency_key);
            return PublishAck::error("envelope too old");
        }

        if self.dedup.lock().get(&envelope.idempotency_key).is_some() {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("duplicate {}", envelope.idempotency_key);
            return PublishAck::ok("duplicate");
        }

        if let Err(e) = self.sink.store(envelope).await {
            self.counters.sink_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!("failed to store {}: {}", envelope.idempotency_key, e);
            return PublishAck::retry("storage unavailable", self.admission.backoff_hint_ms());
        }

        self.dedup.lock().put(envelope.idempotency_key.clone(), ());
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        PublishAck::ok("accepted")
    }

    pub fn stats(&self) -> HandlerStats {
        let c = &self.counters;
        HandlerStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            invalid: c.invalid.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            bad_signature: c.bad_signature.load(Ordering::Relaxed),
            too_old: c.too_old.load(Ordering::Relaxed),
            sink_failures: c.sink_failures.load(Ordering::Relaxed),
        }
    }

    fn signature_trusted(&self, envelope: &Envelope) -> bool {
        self.trusted_keys.is_empty()
            || self
                .trusted_keys
                .iter()
                .any(|key| verify_envelope(key, envelope))
    }

    fn is_too_old(&self, envelope: &Envelope) -> bool {
        match self.max_envelope_age {
            Some(max_age) => {
                let age_ns = now_ns().saturating_sub(envelope.timestamp_ns);
                u128::from(age_ns) > max_age.as_nanos()
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::sink::{MemorySink, SinkError};
    use async_trait::async_trait;
    use vigil::{AckStatus, EnvelopeSigner, Payload, PayloadKind};

    struct FailingSink;

    #[async_trait]
    impl EnvelopeSink for FailingSink {
        async fn store(&self, _envelope: &Envelope) -> Result<(), SinkError> {
            Err(SinkError::Io(std::io::Error::other("disk full")))
        }
    }

    fn signed(signer: &EnvelopeSigner, key: &str, ts: u64) -> Envelope {
        let mut env = Envelope::new(
            ts,
            key,
            Payload {
                kind: PayloadKind::Flow,
                data: b"{\"bytes\":1}".to_vec(),
            },
        );
        signer.sign_envelope(&mut env).unwrap();
        env
    }

    fn handler(
        sink: Arc<dyn EnvelopeSink>,
        admission: AdmissionConfig,
        config: HandlerConfig,
    ) -> PublishHandler {
        PublishHandler::new(
            Arc::new(AdmissionController::new(admission)),
            sink,
            config,
        )
    }

    #[tokio::test]
    async fn test_accept_then_duplicate() {
        let signer = EnvelopeSigner::from_seed(&[9; 32]);
        let sink = Arc::new(MemorySink::new());
        let h = handler(
            sink.clone(),
            AdmissionConfig::default(),
            HandlerConfig {
                trusted_keys: vec![signer.public_key()],
                ..Default::default()
            },
        );

        let env = signed(&signer, "k1", now_ns());
        let ack = h.handle_publish(&env).await;
        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.reason, "accepted");

        let ack = h.handle_publish(&env).await;
        assert_eq!(ack.status, AckStatus::Ok);
        assert_eq!(ack.reason, "duplicate");
        assert_eq!(sink.len(), 1);
        assert_eq!(h.admission().inflight(), 0);
    }

    #[tokio::test]
    async fn test_invalid_does_not_touch_admission() {
        let h = handler(
            Arc::new(MemorySink::new()),
            AdmissionConfig::default(),
            HandlerConfig::default(),
        );
        let mut env = signed(&EnvelopeSigner::from_seed(&[1; 32]), "k1", 0);
        env.timestamp_ns = 0;

        let ack = h.handle_publish(&env).await;
        assert_eq!(ack.status, AckStatus::Invalid);
        assert_eq!(ack.reason, "missing timestamp");
        assert_eq!(h.admission().stats().admitted, 0);
        assert_eq!(h.admission().stats().rejected, 0);
    }

    #[tokio::test]
    async fn test_untrusted_signer_is_error() {
        let trusted = EnvelopeSigner::from_seed(&[1; 32]);
        let stranger = EnvelopeSigner::from_seed(&[2; 32]);
        let sink = Arc::new(MemorySink::new());
        let h = handler(
            sink.clone(),
            AdmissionConfig::default(),
            HandlerConfig {
                trusted_keys: vec![trusted.public_key()],
                ..Default::default()
            },
        );

        let ack = h.handle_publish(&signed(&stranger, "k1", now_ns())).await;
        assert_eq!(ack.status, AckStatus::Error);
        assert_eq!(ack.reason, "signature verification failed");

        let mut tampered = signed(&trusted, "k2", now_ns());
        tampered.payload.data[0] ^= 0x01;
        let ack = h.handle_publish(&tampered).await;
        assert_eq!(ack.status, AckStatus::Error);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_too_old_is_error() {
        let h = handler(
            Arc::new(MemorySink::new()),
            AdmissionConfig::default(),
            HandlerConfig {
                max_envelope_age: Some(Duration::from_secs(60)),
                ..Default::default()
            },
        );
        let signer = EnvelopeSigner::from_seed(&[1; 32]);
        let old = now_ns() - Duration::from_secs(3600).as_nanos() as u64;

        let ack = h.handle_publish(&signed(&signer, "k1", old)).await;
        assert_eq!(ack.status, AckStatus::Error);
        assert_eq!(ack.reason, "envelope too old");

        let ack = h.handle_publish(&signed(&signer, "k2", now_ns())).await;
        assert_eq!(ack.status, AckStatus::Ok);
    }

    #[tokio::test]
    async fn test_sink_failure_is_retry_and_not_deduped() {
        let h = handler(
            Arc::new(FailingSink),
            AdmissionConfig::default(),
            HandlerConfig::default(),
        );
        let env = signed(&EnvelopeSigner::from_seed(&[1; 32]), "k1", now_ns());

        for _ in 0..2 {
            let ack = h.handle_publish(&env).await;
            assert_eq!(ack.status, AckStatus::Retry);
            assert!((100..=1000).contains(&ack.backoff_hint_ms));
        }
        assert_eq!(h.stats().sink_failures, 2);
        assert_eq!(h.stats().duplicates, 0);
    }

    #[tokio::test]
    async fn test_overload_drill() {
        let h = handler(
            Arc::new(MemorySink::new()),
            AdmissionConfig::default(),
            HandlerConfig::default(),
        );
        let env = signed(&EnvelopeSigner::from_seed(&[1; 32]), "k1", now_ns());

        h.set_overload(true);
        let ack = h.handle_publish(&env).await;
        assert_eq!(ack.status, AckStatus::Retry);
        assert_eq!(ack.reason, "overloaded");

        h.set_overload(false);
        assert_eq!(h.handle_publish(&env).await.status, AckStatus::Ok);
    }

    #[tokio::test]
    async fn test_dedup_capacity_is_bounded() {
        let sink = Arc::new(MemorySink::new());
        let h = handler(
            sink.clone(),
            AdmissionConfig::default(),
            HandlerConfig {
                dedup_capacity: 2,
                ..Default::default()
            },
        );
        let signer = EnvelopeSigner::from_seed(&[1; 32]);
        let first = signed(&signer, "k1", now_ns());
        h.handle_publish(&first).await;
        h.handle_publish(&signed(&signer, "k2", now_ns())).await;
        h.handle_publish(&signed(&signer, "k3", now_ns())).await;

        // k1 fell out of the window and is stored again.
        let ack = h.handle_publish(&first).await;
        assert_eq!(ack.reason, "accepted");
        assert_eq!(sink.len(), 4);
    }
}
