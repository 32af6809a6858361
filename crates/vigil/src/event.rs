// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Detector-facing event types.
//!
//! Detectors hand one of these to the agent; the pipeline never looks past
//! the fields used for key derivation.

use crate::envelope::{Payload, PayloadKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Network flow observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    /// IANA protocol number (6 = TCP, 17 = UDP).
    pub protocol: u8,
    #[serde(default)]
    pub bytes: u64,
    #[serde(default)]
    pub packets: u64,
}

/// Process execution observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub host: String,
    pub pid: u32,
    pub ppid: u32,
    pub exe: String,
    #[serde(default)]
    pub cmdline: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
}

/// Generic structured event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub kind: String,
    pub severity: Severity,
    pub timestamp_ns: u64,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Anything a detector can emit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectorEvent {
    Flow(FlowRecord),
    Process(ProcessRecord),
    Telemetry(TelemetryEvent),
}

impl DetectorEvent {
    pub fn kind(&self) -> PayloadKind {
        match self {
            DetectorEvent::Flow(_) => PayloadKind::Flow,
            DetectorEvent::Process(_) => PayloadKind::Process,
            DetectorEvent::Telemetry(_) => PayloadKind::Telemetry,
        }
    }

    /// Timestamp carried by the event itself, if any.
    pub fn own_timestamp_ns(&self) -> Option<u64> {
        match self {
            DetectorEvent::Telemetry(ev) if ev.timestamp_ns > 0 => Some(ev.timestamp_ns),
            _ => None,
        }
    }

    /// Encode as envelope payload (JSON body of the inner record).
    pub fn to_payload(&self) -> Result<Payload, serde_json::Error> {
        let data = match self {
            DetectorEvent::Flow(r) => serde_json::to_vec(r)?,
            DetectorEvent::Process(r) => serde_json::to_vec(r)?,
            DetectorEvent::Telemetry(r) => serde_json::to_vec(r)?,
        };
        Ok(Payload {
            kind: self.kind(),
            data,
        })
    }

    /// Decode a payload produced by [`DetectorEvent::to_payload`].
    pub fn from_payload(payload: &Payload) -> Result<Self, serde_json::Error> {
        Ok(match payload.kind {
            PayloadKind::Flow => DetectorEvent::Flow(serde_json::from_slice(&payload.data)?),
            PayloadKind::Process => DetectorEvent::Process(serde_json::from_slice(&payload.data)?),
            PayloadKind::Telemetry => {
                DetectorEvent::Telemetry(serde_json::from_slice(&payload.data)?)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_event_json_tagging() {
        let line = r#"{"type":"flow","src_ip":"10.0.0.1","dst_ip":"10.0.0.2",
            "src_port":51000,"dst_port":443,"protocol":6}"#;
        let ev: DetectorEvent = serde_json::from_str(line).unwrap();
        assert_eq!(ev.kind(), PayloadKind::Flow);

        let payload = ev.to_payload().unwrap();
        assert_eq!(DetectorEvent::from_payload(&payload).unwrap(), ev);
    }

    #[test]
    fn test_telemetry_timestamp_used_when_present() {
        let ev = DetectorEvent::Telemetry(TelemetryEvent {
            kind: "auth_failure".into(),
            severity: Severity::High,
            timestamp_ns: 5,
            attributes: BTreeMap::new(),
        });
        assert_eq!(ev.own_timestamp_ns(), Some(5));
    }
}
