//! Gateway supervision
//!
//! Gateways bridge end devices to the service. The [`GatewayManager`] keeps
//! their records, decides liveness from heartbeats, tests connectivity per
//! protocol and links devices to the gateway that bridges them.
//!
//! Status per gateway:
//!
//! ```text
//! Disconnected --(connection test ok | heartbeat)--> Connected
//! Connected --(heartbeat overdue)--> Disconnected
//! any --(connection test failed | reported error)--> Error
//! ```

use crate::collaborators::PersistenceError;
use crate::protocol::TopicError;
use thiserror::Error;

pub mod credentials;
pub mod manager;
pub mod model;
pub mod probe;

pub use credentials::{generate_credentials, GatewayCredentials};
pub use manager::{GatewayManager, HEARTBEAT_TIMEOUT_REASON, MAX_HEARTBEAT_INTERVAL_SECS};
pub use model::{
    ConnectedDevice, Gateway, GatewayEndpoint, GatewayProtocol, GatewayStatus,
    GatewayStatusCounts, NewGateway,
};
pub use probe::{
    BrokerProbe, ConnectionProbe, ConnectionTestOutcome, HttpProbe, ProbeFailure, TcpProbe,
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Gateway not found: {0}")]
    NotFound(String),
    #[error("Gateway already exists: {0}")]
    AlreadyExists(String),
    #[error("Gateway {gateway_id} still has {count} connected device(s)")]
    DevicesLinked { gateway_id: String, count: usize },
    #[error("Device not found: {0}")]
    UnknownDevice(String),
    #[error("Heartbeat interval must be between 1 and {max} seconds, got {0}", max = manager::MAX_HEARTBEAT_INTERVAL_SECS)]
    InvalidHeartbeatInterval(u64),
    #[error("Invalid gateway identifier: {0}")]
    InvalidId(#[from] TopicError),
    #[error("No connection probe for protocol {0}")]
    NoProbe(GatewayProtocol),
    #[error("Persistence failure: {0}")]
    Persistence(#[from] PersistenceError),
}
