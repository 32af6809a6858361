// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publish acknowledgement, shared by agent and broker.
//!
//! | Status    | Value | Caller action                     |
//! |-----------|-------|-----------------------------------|
//! | `Ok`      | 0     | done                              |
//! | `Retry`   | 1     | keep the envelope, back off       |
//! | `Invalid` | 2     | drop, the data is malformed       |
//! | `Error`   | 3     | drop, permanent rejection         |

use serde::{Deserialize, Serialize};

/// Ack status, encoded as an integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum AckStatus {
    Ok,
    Retry,
    Invalid,
    Error,
}

impl AckStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AckStatus::Ok => "ok",
            AckStatus::Retry => "retry",
            AckStatus::Invalid => "invalid",
            AckStatus::Error => "error",
        }
    }

    /// Invalid and Error are final: resending the same bytes cannot succeed.
    pub fn is_permanent_failure(self) -> bool {
        matches!(self, AckStatus::Invalid | AckStatus::Error)
    }
}

impl From<AckStatus> for u8 {
    fn from(status: AckStatus) -> u8 {
        match status {
            AckStatus::Ok => 0,
            AckStatus::Retry => 1,
            AckStatus::Invalid => 2,
            AckStatus::Error => 3,
        }
    }
}

impl TryFrom<u8> for AckStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, String> {
        match value {
            0 => Ok(AckStatus::Ok),
            1 => Ok(AckStatus::Retry),
            2 => Ok(AckStatus::Invalid),
            3 => Ok(AckStatus::Error),
            other => Err(format!("unknown ack status {other}")),
        }
    }
}

impl std::fmt::Display for AckStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broker response to one publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishAck {
    pub status: AckStatus,
    #[serde(default)]
    pub reason: String,
    /// Suggested wait before retrying; meaningful only for `Retry`.
    #[serde(default)]
    pub backoff_hint_ms: u64,
}

impl PublishAck {
    pub fn ok(reason: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Ok,
            reason: reason.into(),
            backoff_hint_ms: 0,
        }
    }

    pub fn retry(reason: impl Into<String>, backoff_hint_ms: u64) -> Self {
        Self {
            status: AckStatus::Retry,
            reason: reason.into(),
            backoff_hint_ms,
        }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Invalid,
            reason: reason.into(),
            backoff_hint_ms: 0,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Error,
            reason: reason.into(),
            backoff_hint_ms: 0,
        }
    }
}
