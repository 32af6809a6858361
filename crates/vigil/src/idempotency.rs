// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Idempotency key derivation.
//!
//! Keys are lowercase hex SHA-256 digests over a fixed tuple per event kind:
//!
//! | Kind      | Tuple                                                      |
//! |-----------|------------------------------------------------------------|
//! | flow      | timestamp_ns, src_ip, dst_ip, src_port, dst_port, protocol |
//! | process   | timestamp_ns, host, pid, ppid, exe                         |
//! | telemetry | timestamp_ns, kind, severity, attributes (key order)       |
//!
//! Every field is length-prefixed and the tuple starts with the payload
//! tag, so re-sending the same logical event yields the same key and two
//! different kinds never share one. Counters such as flow byte totals are
//! deliberately not part of the tuple.

use crate::event::DetectorEvent;
use sha2::{Digest, Sha256};

/// Derive the idempotency key for `event` observed at `timestamp_ns`.
pub fn derive_key(event: &DetectorEvent, timestamp_ns: u64) -> String {
    let mut h = KeyHasher::new(event.kind().tag(), timestamp_ns);
    match event {
        DetectorEvent::Flow(f) => {
            h.field(f.src_ip.to_string().as_bytes());
            h.field(f.dst_ip.to_string().as_bytes());
            h.field(&f.src_port.to_be_bytes());
            h.field(&f.dst_port.to_be_bytes());
            h.field(&[f.protocol]);
        }
        DetectorEvent::Process(p) => {
            h.field(p.host.as_bytes());
            h.field(&p.pid.to_be_bytes());
            h.field(&p.ppid.to_be_bytes());
            h.field(p.exe.as_bytes());
        }
        DetectorEvent::Telemetry(t) => {
            h.field(t.kind.as_bytes());
            h.field(t.severity.as_str().as_bytes());
            // BTreeMap iterates in key order.
            for (k, v) in &t.attributes {
                h.field(k.as_bytes());
                h.field(v.as_bytes());
            }
        }
    }
    h.finish()
}

struct KeyHasher(Sha256);

impl KeyHasher {
    fn new(tag: u8, timestamp_ns: u64) -> Self {
        let mut h = Sha256::new();
        h.update([tag]);
        h.update(timestamp_ns.to_be_bytes());
        Self(h)
    }

    fn field(&mut self, bytes: &[u8]) {
        self.0.update((bytes.len() as u32).to_be_bytes());
        self.0.update(bytes);
    }

    fn finish(self) -> String {
        hex::encode(self.0.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{FlowRecord, ProcessRecord, Severity, TelemetryEvent};
    use std::collections::BTreeMap;

    fn flow() -> FlowRecord {
        FlowRecord {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "93.184.216.34".parse().unwrap(),
            src_port: 51000,
            dst_port: 443,
            protocol: 6,
            bytes: 100,
            packets: 2,
        }
    }

    #[test]
    fn test_same_event_same_key() {
        let a = derive_key(&DetectorEvent::Flow(flow()), 1000);
        let b = derive_key(&DetectorEvent::Flow(flow()), 1000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_counters_do_not_affect_flow_key() {
        let mut other = flow();
        other.bytes = 9999;
        other.packets = 77;
        assert_eq!(
            derive_key(&DetectorEvent::Flow(flow()), 1000),
            derive_key(&DetectorEvent::Flow(other), 1000)
        );
    }

    #[test]
    fn test_distinguishing_fields_change_key() {
        let base = derive_key(&DetectorEvent::Flow(flow()), 1000);
        assert_ne!(base, derive_key(&DetectorEvent::Flow(flow()), 1001));

        let mut f = flow();
        f.dst_port = 80;
        assert_ne!(base, derive_key(&DetectorEvent::Flow(f), 1000));

        let mut f = flow();
        f.protocol = 17;
        assert_ne!(base, derive_key(&DetectorEvent::Flow(f), 1000));
    }

    #[test]
    fn test_process_and_telemetry_keys() {
        let proc_ev = DetectorEvent::Process(ProcessRecord {
            host: "web-1".into(),
            pid: 4242,
            ppid: 1,
            exe: "/usr/bin/curl".into(),
            cmdline: vec!["curl".into()],
            user: None,
        });
        let mut attrs = BTreeMap::new();
        attrs.insert("user".to_string(), "root".to_string());
        let tel_ev = DetectorEvent::Telemetry(TelemetryEvent {
            kind: "auth_failure".into(),
            severity: Severity::High,
            timestamp_ns: 1000,
            attributes: attrs.clone(),
        });

        let p = derive_key(&proc_ev, 1000);
        let t = derive_key(&tel_ev, 1000);
        assert_ne!(p, t);

        attrs.insert("user".to_string(), "admin".to_string());
        let tel_ev2 = DetectorEvent::Telemetry(TelemetryEvent {
            kind: "auth_failure".into(),
            severity: Severity::High,
            timestamp_ns: 1000,
            attributes: attrs,
        });
        assert_ne!(t, derive_key(&tel_ev2, 1000));
    }
}
