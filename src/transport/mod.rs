//! Transport layer for device messaging
//!
//! [`Broker`] abstracts one publish/subscribe transport connection. Two
//! implementations exist, selected at construction time from configuration:
//!
//! - [`mqtt::MqttBroker`] - a real MQTT v5 broker connection (rumqttc)
//! - [`memory::MemoryBroker`] - an in-process broker with the same topic matching
//!
//! [`ConnectionManager`] sits on top of a broker and owns the connection lifecycle:
//! idempotent connect, subscription replay, single-flight reconnect with backoff,
//! and the internal event bus consumed by the router.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;

pub mod manager;
pub mod memory;
pub mod mqtt;

pub use manager::ConnectionManager;
pub use memory::MemoryBroker;
pub use mqtt::{ConnectionState, MqttBroker, MqttError, ReconnectConfig};

/// Delivery guarantee for a publish or subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }

    pub fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Options for a single publish
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PublishOptions {
    pub qos: QoS,
    pub retain: bool,
}

impl PublishOptions {
    pub fn at_least_once() -> Self {
        Self {
            qos: QoS::AtLeastOnce,
            retain: false,
        }
    }

    pub fn retained(qos: QoS) -> Self {
        Self { qos, retain: true }
    }
}

/// When the broker should forward retained messages for a new subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetainHandling {
    #[default]
    SendOnSubscribe,
    SendOnNewSubscription,
    DoNotSend,
}

/// Options for a broker-level subscription
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SubscribeOptions {
    pub qos: QoS,
    /// Do not deliver messages published by this connection
    pub no_local: bool,
    pub retain_handling: RetainHandling,
}

/// A message delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Raw events emitted by a [`Broker`] implementation
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Message(IncomingMessage),
    /// The established connection dropped without a caller-initiated disconnect
    ConnectionLost(String),
}

/// Events published on the connection manager's bus
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected {
        reason: String,
        caller_initiated: bool,
    },
    Message(IncomingMessage),
}

/// One publish/subscribe transport connection
///
/// `connect` performs exactly one connection attempt and resolves once the broker
/// acknowledges it. Reconnection policy lives in [`ConnectionManager`], not here.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Attempt a single connection
    async fn connect(&self) -> Result<(), MqttError>;

    /// Close the connection; events for it stop after this returns
    async fn disconnect(&self) -> Result<(), MqttError>;

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), MqttError>;

    async fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Result<(), MqttError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError>;

    /// Take the event stream; only the first caller receives it
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BrokerEvent>>;

    /// Short name used in logs and health output
    fn kind(&self) -> &'static str;
}

/// Last-seen payload per topic for retained messages
///
/// Entries are overwritten on every retained publish or receive and never
/// expire; the cache is bounded by the number of distinct retained topics.
#[derive(Debug, Default)]
pub struct TopicCache {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl TopicCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store(&self, topic: &str, payload: Bytes) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(topic.to_string(), payload);
    }

    pub fn get(&self, topic: &str) -> Option<Bytes> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(topic).cloned()
    }

    /// All cached entries whose topic matches `pattern`
    pub fn matching(&self, pattern: &str) -> Vec<(String, Bytes)> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|(topic, _)| crate::protocol::matches(pattern, topic))
            .map(|(topic, payload)| (topic.clone(), payload.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
