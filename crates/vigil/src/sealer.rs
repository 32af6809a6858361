// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Turns detector events into signed, chained envelopes.

use crate::envelope::{Envelope, EnvelopeError};
use crate::event::DetectorEvent;
use crate::idempotency::derive_key;
use crate::signing::EnvelopeSigner;
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock Unix nanoseconds.
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Seals events from one source.
///
/// Each envelope's `previous_signature` is the signature of the envelope
/// sealed just before it by the same `Sealer`.
#[derive(Debug)]
pub struct Sealer {
    signer: EnvelopeSigner,
    last_signature: Mutex<Option<Vec<u8>>>,
}

impl Sealer {
    pub fn new(signer: EnvelopeSigner) -> Self {
        Self {
            signer,
            last_signature: Mutex::new(None),
        }
    }

    pub fn signer(&self) -> &EnvelopeSigner {
        &self.signer
    }

    /// Seal using the event's own timestamp, or now.
    pub fn seal(&self, event: &DetectorEvent) -> Result<Envelope, EnvelopeError> {
        let ts = event.own_timestamp_ns().unwrap_or_else(now_ns);
        self.seal_at(event, ts)
    }

    /// Seal with an explicit timestamp.
    pub fn seal_at(&self, event: &DetectorEvent, timestamp_ns: u64) -> Result<Envelope, EnvelopeError> {
        let payload = event.to_payload()?;
        let key = derive_key(event, timestamp_ns);
        let mut envelope = Envelope::new(timestamp_ns, key, payload);

        // Hold the lock across signing so concurrent callers form one chain.
        let mut last = self.last_signature.lock();
        envelope.previous_signature = last.clone();
        self.signer.sign_envelope(&mut envelope)?;
        *last = Some(envelope.signature.clone());
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Severity, TelemetryEvent};
    use crate::signing::verify_envelope;
    use std::collections::BTreeMap;

    fn event(kind: &str) -> DetectorEvent {
        DetectorEvent::Telemetry(TelemetryEvent {
            kind: kind.into(),
            severity: Severity::Medium,
            timestamp_ns: 0,
            attributes: BTreeMap::new(),
        })
    }

    #[test]
    fn test_sealed_envelopes_verify_and_chain() {
        let sealer = Sealer::new(EnvelopeSigner::generate());
        let first = sealer.seal_at(&event("a"), 10).unwrap();
        let second = sealer.seal_at(&event("b"), 20).unwrap();

        let pk = sealer.signer().public_key();
        assert!(verify_envelope(&pk, &first));
        assert!(verify_envelope(&pk, &second));
        assert!(first.previous_signature.is_none());
        assert!(second.follows(&first));
        assert!(first.validate().is_ok());
    }

    #[test]
    fn test_same_event_same_key_across_sealers() {
        let a = Sealer::new(EnvelopeSigner::generate());
        let b = Sealer::new(EnvelopeSigner::generate());
        assert_eq!(
            a.seal_at(&event("x"), 99).unwrap().idempotency_key,
            b.seal_at(&event("x"), 99).unwrap().idempotency_key
        );
    }

    #[test]
    fn test_seal_uses_current_time_when_event_has_none() {
        let sealer = Sealer::new(EnvelopeSigner::generate());
        let before = now_ns();
        let env = sealer.seal(&event("a")).unwrap();
        assert!(env.timestamp_ns >= before);
    }
}
