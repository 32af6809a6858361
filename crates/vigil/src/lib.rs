// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Vigil core
//!
//! Shared building blocks of the telemetry delivery pipeline, used by both
//! the agent and the broker.
//!
//! # Features
//!
//! - **Envelope codec** -- versioned JSON container with base64 byte fields
//! - **Canonical form** -- fixed big-endian layout that signatures cover
//! - **Signing** -- Ed25519 keys stored as hex seed files
//! - **Idempotency keys** -- deterministic SHA-256 over per-kind event fields
//! - **Wire framing** -- length-prefixed JSON publish/ack frames
//! - **Mutual TLS** -- rustls configs loaded from a certificate directory
//!
//! # Data flow
//!
//! ```text
//! DetectorEvent --Sealer--> Envelope (signed, chained)
//!                              |
//!                              v
//!                 Frame::Publish --wire--> broker
//!                 Frame::Ack     <--wire-- PublishAck { status, reason, backoff_hint_ms }
//! ```
//!
//! # Example
//!
//! ```ignore
//! use vigil::{DetectorEvent, EnvelopeSigner, Sealer};
//!
//! let sealer = Sealer::new(EnvelopeSigner::load("agent.key")?);
//! let envelope = sealer.seal(&event)?;
//! let bytes = envelope.to_bytes()?;
//! ```

pub mod ack;
pub mod canonical;
pub mod envelope;
pub mod event;
pub mod idempotency;
pub mod sealer;
pub mod shutdown;
pub mod signing;
pub mod tls;
pub mod wire;

pub use ack::{AckStatus, PublishAck};
pub use canonical::canonicalize;
pub use envelope::{Envelope, EnvelopeError, Payload, PayloadKind, ENVELOPE_VERSION};
pub use event::{DetectorEvent, FlowRecord, ProcessRecord, Severity, TelemetryEvent};
pub use idempotency::derive_key;
pub use sealer::{now_ns, Sealer};
pub use shutdown::Shutdown;
pub use signing::{verify, verify_envelope, EnvelopeSigner, SigningError};
pub use tls::{server_name, TlsConfig, TlsError};
pub use wire::{Frame, FramedStream, WireError, DEFAULT_MAX_FRAME_SIZE};
