// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Vigil broker
//!
//! Receives signed envelopes from agents and answers each with exactly one
//! ack. Admission is bounded and never waits: at capacity, agents are told to
//! RETRY with a randomized backoff hint and keep the envelope in their own
//! durable queue.
//!
//! # Example
//!
//! ```ignore
//! use vigil::Shutdown;
//! use vigil_broker::{BrokerConfig, BrokerServer};
//!
//! let server = BrokerServer::new(BrokerConfig::from_file("broker.toml")?)?;
//! server.run(Shutdown::new()).await?;
//! ```

pub mod admission;
pub mod config;
pub mod handler;
pub mod server;
pub mod sink;

pub use admission::{
    AdmissionConfig, AdmissionController, AdmissionPermit, AdmissionStats, RejectReason, Rejected,
};
pub use config::{BrokerConfig, ConfigError};
pub use handler::{HandlerConfig, HandlerStats, PublishHandler};
pub use server::{serve_connection, BrokerServer, ServerError};
pub use sink::{EnvelopeSink, JsonlSink, MemorySink, SinkError};
