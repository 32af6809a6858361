// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Canonical envelope encoding for signing.
//!
//! # Layout (big-endian)
//!
//! ```text
//! +--------------+-----------------+------------------+
//! | magic (4)    | version_len (4) | version (var)    |
//! +--------------+-----------------+------------------+
//! | timestamp_ns (8)               | key_len (4)      |
//! +--------------------------------+------------------+
//! | idempotency_key (var)                             |
//! +------------------+---------------+----------------+
//! | payload_kind (1) | data_len (4)  | data (var)     |
//! +------------------+---------------+----------------+
//! ```
//!
//! Only `{version, timestamp_ns, idempotency_key, payload}` are encoded.
//! `signature` and `previous_signature` never are. The layout does not go
//! through serde so it cannot drift with library versions.

use crate::envelope::{Envelope, EnvelopeError};

/// Magic prefix: "VGL1".
pub const CANONICAL_MAGIC: [u8; 4] = *b"VGL1";

/// Canonical bytes of `envelope`, the input to signing and verification.
///
/// Fails only if a field is too long for its `u32` length prefix.
pub fn canonicalize(envelope: &Envelope) -> Result<Vec<u8>, EnvelopeError> {
    let data = &envelope.payload.data;
    let mut out = Vec::with_capacity(
        4 + 4
            + envelope.version.len()
            + 8
            + 4
            + envelope.idempotency_key.len()
            + 1
            + 4
            + data.len(),
    );

    out.extend_from_slice(&CANONICAL_MAGIC);
    write_field(&mut out, "version", envelope.version.as_bytes())?;
    out.extend_from_slice(&envelope.timestamp_ns.to_be_bytes());
    write_field(&mut out, "idempotency_key", envelope.idempotency_key.as_bytes())?;
    out.push(envelope.payload.kind.tag());
    write_field(&mut out, "payload", data)?;
    Ok(out)
}

fn write_field(out: &mut Vec<u8>, field: &'static str, bytes: &[u8]) -> Result<(), EnvelopeError> {
    out.extend_from_slice(&field_len(field, bytes.len())?.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn field_len(field: &'static str, len: usize) -> Result<u32, EnvelopeError> {
    u32::try_from(len).map_err(|_| EnvelopeError::FieldTooLarge { field, len })
}
