// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Envelope - the unit of transport.
//!
//! An envelope wraps exactly one detector event together with the metadata
//! every durability layer keys on (version, creation time, idempotency key)
//! and a detached signature over its canonical form.
//!
//! # JSON form
//!
//! ```text
//! {
//!   "version": "v1",
//!   "timestamp_ns": 1718000000000000000,
//!   "idempotency_key": "9f2c...",
//!   "payload": { "kind": "flow", "data": "<base64>" },
//!   "signature": "<base64>",
//!   "previous_signature": "<base64>" | null
//! }
//! ```
//!
//! The same JSON bytes travel on the wire and sit in the local queue.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Current envelope schema version.
pub const ENVELOPE_VERSION: &str = "v1";

/// Errors raised while encoding or decoding an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{field} is {len} bytes, above the u32 length prefix")]
    FieldTooLarge { field: &'static str, len: usize },
}

/// Payload discriminator.
///
/// Tags are part of the canonical encoding and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Network flow record.
    Flow,
    /// Process execution record.
    Process,
    /// Generic metric / telemetry event.
    Telemetry,
}

impl PayloadKind {
    /// Stable one-byte tag used by canonicalization and key derivation.
    pub fn tag(self) -> u8 {
        match self {
            PayloadKind::Flow => 1,
            PayloadKind::Process => 2,
            PayloadKind::Telemetry => 3,
        }
    }

    /// Inverse of [`PayloadKind::tag`].
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(PayloadKind::Flow),
            2 => Some(PayloadKind::Process),
            3 => Some(PayloadKind::Telemetry),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PayloadKind::Flow => "flow",
            PayloadKind::Process => "process",
            PayloadKind::Telemetry => "telemetry",
        }
    }
}

/// Opaque payload bytes plus a discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub kind: PayloadKind,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Signed, versioned container for one telemetry event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Schema version string (e.g. "v1").
    pub version: String,

    /// Creation time (Unix nanoseconds).
    pub timestamp_ns: u64,

    /// Deterministic per-event key; same key = same logical event.
    pub idempotency_key: String,

    /// Event body.
    pub payload: Payload,

    /// Detached Ed25519 signature over the canonical bytes.
    #[serde(default, with = "base64_bytes")]
    pub signature: Vec<u8>,

    /// Signature of the previous envelope from the same source.
    #[serde(default, with = "base64_opt_bytes")]
    pub previous_signature: Option<Vec<u8>>,
}

impl Envelope {
    /// Build an unsigned envelope at the current schema version.
    pub fn new(timestamp_ns: u64, idempotency_key: impl Into<String>, payload: Payload) -> Self {
        Self {
            version: ENVELOPE_VERSION.to_string(),
            timestamp_ns,
            idempotency_key: idempotency_key.into(),
            payload,
            signature: Vec::new(),
            previous_signature: None,
        }
    }

    /// Serialize to the JSON bytes used on the wire and in the queue.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse bytes produced by [`Envelope::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Serialized size in bytes.
    pub fn encoded_len(&self) -> Result<usize, EnvelopeError> {
        Ok(self.to_bytes()?.len())
    }

    /// Structural validation applied by the broker before admission.
    ///
    /// Returns a human-readable reason for the first missing field.
    pub fn validate(&self) -> Result<(), String> {
        if self.version.is_empty() {
            return Err("missing version".into());
        }
        if self.version != ENVELOPE_VERSION {
            return Err(format!("unsupported version '{}'", self.version));
        }
        if self.timestamp_ns == 0 {
            return Err("missing timestamp".into());
        }
        if self.idempotency_key.trim().is_empty() {
            return Err("missing idempotency key".into());
        }
        if self.signature.is_empty() {
            return Err("missing signature".into());
        }
        Ok(())
    }

    /// True if this envelope chains directly to `previous`.
    pub fn follows(&self, previous: &Envelope) -> bool {
        match &self.previous_signature {
            Some(prev) => !previous.signature.is_empty() && *prev == previous.signature,
            None => false,
        }
    }
}

/// Serde adapter: `Vec<u8>` as standard base64.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Option<Vec<u8>>` as base64 or null.
pub(crate) mod base64_opt_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => s.serialize_some(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let s: Option<String> = Option::deserialize(d)?;
        s.map(|s| STANDARD.decode(s.as_bytes()).map_err(serde::de::Error::custom))
            .transpose()
    }
}
