//! In-process broker used when no broker URL is configured
//!
//! Applies the same topic matching as a real broker, keeps retained messages and
//! replays them on subscribe. Every published message is delivered at most once
//! to this connection, however many of its filters match.
//!
//! Tests drive it from the "device side" with [`MemoryBroker::inject`] and can
//! simulate connection loss and refused connects.

use crate::protocol;
use crate::transport::{
    Broker, BrokerEvent, ConnectionState, IncomingMessage, MqttError, PublishOptions, QoS,
    RetainHandling, SubscribeOptions,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct BrokerInner {
    connected: bool,
    /// Active filters with the QoS granted for each
    filters: BTreeMap<String, QoS>,
    retained: HashMap<String, (Bytes, QoS)>,
}

/// Broker simulation with real topic semantics
pub struct MemoryBroker {
    inner: Mutex<BrokerInner>,
    events_tx: mpsc::UnboundedSender<BrokerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<BrokerEvent>>>,
    connect_attempts: AtomicU32,
    subscribe_calls: AtomicU32,
    failing_connects: AtomicU32,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Mutex::new(BrokerInner::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            connect_attempts: AtomicU32::new(0),
            subscribe_calls: AtomicU32::new(0),
            failing_connects: AtomicU32::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn not_connected() -> MqttError {
        MqttError::NotConnected {
            state: ConnectionState::Disconnected("in-memory broker not connected".to_string()),
        }
    }

    /// Route one message to this connection if any active filter matches
    fn route(&self, inner: &BrokerInner, topic: &str, payload: Bytes, qos: QoS) {
        if !inner.connected {
            return;
        }

        let granted = inner
            .filters
            .iter()
            .filter(|(filter, _)| protocol::matches(filter, topic))
            .map(|(_, granted)| *granted)
            .max_by_key(|q| q.level());

        if let Some(granted) = granted {
            let effective = if qos.level() <= granted.level() { qos } else { granted };
            let _ = self.events_tx.send(BrokerEvent::Message(IncomingMessage {
                topic: topic.to_string(),
                payload,
                qos: effective,
                retain: false,
            }));
        }
    }

    fn store_retained(inner: &mut BrokerInner, topic: &str, payload: &Bytes, qos: QoS) {
        if payload.is_empty() {
            inner.retained.remove(topic);
        } else {
            inner.retained.insert(topic.to_string(), (payload.clone(), qos));
        }
    }

    /// Publish as another client would (a device or gateway)
    ///
    /// Retained messages are stored even while this connection is down; live
    /// delivery only happens while connected.
    pub fn inject(&self, topic: &str, payload: impl Into<Bytes>, retain: bool) {
        let payload = payload.into();
        let mut inner = self.lock();
        if retain {
            Self::store_retained(&mut inner, topic, &payload, QoS::AtLeastOnce);
        }
        self.route(&inner, topic, payload, QoS::AtLeastOnce);
    }

    /// Simulate the broker dropping the connection
    pub fn drop_connection(&self, reason: &str) {
        let mut inner = self.lock();
        if !inner.connected {
            return;
        }
        inner.connected = false;
        inner.filters.clear();
        drop(inner);

        warn!("In-memory broker dropped connection: {}", reason);
        let _ = self
            .events_tx
            .send(BrokerEvent::ConnectionLost(reason.to_string()));
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connects(&self, count: u32) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    /// Connection attempts made so far, including refused ones
    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Broker-level subscribe requests received so far
    pub fn subscribe_calls(&self) -> u32 {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Active filters, sorted
    pub fn active_filters(&self) -> Vec<String> {
        self.lock().filters.keys().cloned().collect()
    }

    pub fn retained_payload(&self, topic: &str) -> Option<Bytes> {
        self.lock().retained.get(topic).map(|(payload, _)| payload.clone())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> Result<(), MqttError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            debug!("In-memory broker refusing connection attempt");
            return Err(MqttError::ConnectionFailedStr(
                "in-memory broker refused connection".to_string(),
            ));
        }

        self.lock().connected = true;
        info!("Connected to in-memory broker");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        let mut inner = self.lock();
        inner.connected = false;
        inner.filters.clear();
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), MqttError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(Self::not_connected());
        }
        if options.retain {
            Self::store_retained(&mut inner, topic, &payload, options.qos);
        }
        self.route(&inner, topic, payload, options.qos);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Result<(), MqttError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(Self::not_connected());
        }
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let is_new = inner.filters.insert(topic.to_string(), options.qos).is_none();
        let replay = match options.retain_handling {
            RetainHandling::SendOnSubscribe => true,
            RetainHandling::SendOnNewSubscription => is_new,
            RetainHandling::DoNotSend => false,
        };

        if replay {
            let mut matching: Vec<_> = inner
                .retained
                .iter()
                .filter(|(retained_topic, _)| protocol::matches(topic, retained_topic))
                .collect();
            matching.sort_by(|a, b| a.0.cmp(b.0));

            for (retained_topic, (payload, qos)) in matching {
                let effective = if qos.level() <= options.qos.level() {
                    *qos
                } else {
                    options.qos
                };
                let _ = self.events_tx.send(BrokerEvent::Message(IncomingMessage {
                    topic: retained_topic.clone(),
                    payload: payload.clone(),
                    qos: effective,
                    retain: true,
                }));
            }
        }

        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(Self::not_connected());
        }
        inner.filters.remove(topic);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BrokerEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expect_message(event: Option<BrokerEvent>) -> IncomingMessage {
        match event {
            Some(BrokerEvent::Message(message)) => message,
            other => panic!("Expected message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_publish_delivers_to_matching_subscription() {
        let broker = MemoryBroker::new();
        let mut events = broker.take_events().unwrap();
        broker.connect().await.unwrap();
        broker
            .subscribe("ems/+/devices/+/telemetry", SubscribeOptions::default())
            .await
            .unwrap();

        broker.inject("ems/3/devices/9/telemetry", r#"{"power":1}"#, false);
        broker.inject("ems/3/energy", "{}", false);

        let message = expect_message(events.recv().await);
        assert_eq!(message.topic, "ems/3/devices/9/telemetry");
        assert!(!message.retain);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_overlapping_filters_deliver_once() {
        let broker = MemoryBroker::new();
        let mut events = broker.take_events().unwrap();
        broker.connect().await.unwrap();
        broker.subscribe("a/+/b", SubscribeOptions::default()).await.unwrap();
        broker.subscribe("a/#", SubscribeOptions::default()).await.unwrap();

        broker.inject("a/x/b", "1", false);

        expect_message(events.recv().await);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retained_message_replayed_on_subscribe() {
        let broker = MemoryBroker::new();
        let mut events = broker.take_events().unwrap();
        broker.inject("ems/system/status", r#"{"status":"online"}"#, true);

        broker.connect().await.unwrap();
        broker
            .subscribe("ems/system/status", SubscribeOptions::default())
            .await
            .unwrap();

        let message = expect_message(events.recv().await);
        assert!(message.retain);
        assert_eq!(&message.payload[..], br#"{"status":"online"}"#);
    }

    #[tokio::test]
    async fn test_retain_handling_do_not_send() {
        let broker = MemoryBroker::new();
        let mut events = broker.take_events().unwrap();
        broker.inject("ems/system/status", "online", true);
        broker.connect().await.unwrap();

        let options = SubscribeOptions {
            retain_handling: RetainHandling::DoNotSend,
            ..Default::default()
        };
        broker.subscribe("ems/system/status", options).await.unwrap();
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_retained_payload_clears_entry() {
        let broker = MemoryBroker::new();
        broker.inject("ems/system/status", "online", true);
        assert!(broker.retained_payload("ems/system/status").is_some());

        broker.inject("ems/system/status", Bytes::new(), true);
        assert!(broker.retained_payload("ems/system/status").is_none());
    }

    #[tokio::test]
    async fn test_operations_require_connection() {
        let broker = MemoryBroker::new();
        let result = broker
            .publish("ems/x", Bytes::from_static(b"1"), PublishOptions::default())
            .await;
        assert!(matches!(result, Err(MqttError::NotConnected { .. })));
        assert!(broker.subscribe("ems/#", SubscribeOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_drop_connection_emits_loss_and_clears_filters() {
        let broker = MemoryBroker::new();
        let mut events = broker.take_events().unwrap();
        broker.connect().await.unwrap();
        broker.subscribe("ems/#", SubscribeOptions::default()).await.unwrap();

        broker.drop_connection("network down");

        assert_eq!(
            events.recv().await,
            Some(BrokerEvent::ConnectionLost("network down".to_string()))
        );
        assert!(!broker.is_connected());
        assert!(broker.active_filters().is_empty());
    }

    #[tokio::test]
    async fn test_fail_next_connects() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(2);

        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_granted_qos_caps_delivery() {
        let broker = MemoryBroker::new();
        let mut events = broker.take_events().unwrap();
        broker.connect().await.unwrap();
        let options = SubscribeOptions {
            qos: QoS::AtMostOnce,
            ..Default::default()
        };
        broker.subscribe("ems/#", options).await.unwrap();

        broker
            .publish(
                "ems/1/energy",
                Bytes::from_static(b"{}"),
                PublishOptions {
                    qos: QoS::ExactlyOnce,
                    retain: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(expect_message(events.recv().await).qos, QoS::AtMostOnce);
    }
}
