//! Device messaging core for an energy-monitoring system
//!
//! Keeps a persistent broker connection, routes inbound telemetry and status
//! messages to handlers by topic shape, correlates outbound commands with
//! their asynchronous responses and supervises gateway liveness.
//!
//! # Overview
//!
//! - [`protocol`] - topic matching with named parameters, wire envelopes
//! - [`transport`] - the [`transport::Broker`] seam with an MQTT v5 and an
//!   in-memory implementation, and the [`transport::ConnectionManager`]
//! - [`routing`] - the [`routing::MessageRouter`] and handler trait
//! - [`commands`] - request/response semantics over publish/subscribe
//! - [`gateway`] - gateway records, heartbeats, protocol probes, credentials
//! - [`handlers`] - telemetry, energy, status and heartbeat handlers
//! - [`service`] - wiring and lifecycle for the binary
//!
//! # Quick Start
//!
//! ```rust
//! use ems_messaging::protocol::{extract, matches, TopicBuilder};
//!
//! let topics = TopicBuilder::new("ems");
//! let pattern = topics.telemetry_pattern();
//! let topic = topics.device_telemetry("3", "9");
//!
//! assert!(matches(&pattern, &topic));
//! let params = extract(&pattern, &topic).unwrap();
//! assert_eq!(params["siteId"], "3");
//! assert_eq!(params["deviceId"], "9");
//! ```

pub mod collaborators;
pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod observability;
pub mod protocol;
pub mod routing;
pub mod service;
pub mod testing;
pub mod transport;

pub use commands::{CommandCorrelator, CommandOutcome, CommandTarget};
pub use config::{AppConfig, ConfigError};
pub use error::{EmsError, EmsResult};
pub use gateway::GatewayManager;
pub use routing::MessageRouter;
pub use service::{Collaborators, MessagingService};
pub use transport::ConnectionManager;
