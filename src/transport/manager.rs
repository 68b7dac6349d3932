//! Connection lifecycle on top of a [`Broker`]
//!
//! The manager owns the single broker connection of the service:
//!
//! - `connect` is idempotent; concurrent callers share one transport attempt
//! - subscriptions are recorded and replayed on every (re)connect before the
//!   state becomes `Connected`
//! - an unexpected loss starts one reconnect loop with backoff; a loss reported
//!   while an attempt is still replaying subscriptions fails that attempt
//! - publishing fails fast with [`MqttError::NotConnected`] unless connected
//! - inbound messages and lifecycle changes go out on a broadcast bus

use super::mqtt::health_monitor::{HealthMetrics, HealthMonitor, ReconnectionDecision, StateTransition};
use super::{
    Broker, BrokerEvent, ConnectionEvent, ConnectionState, IncomingMessage, MemoryBroker,
    MqttBroker, MqttError, PublishOptions, ReconnectConfig, SubscribeOptions, TopicCache,
};
use crate::config::AppConfig;
use crate::observability::MetricsCollector;
use crate::transport::mqtt::MqttSettings;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pick the broker implementation for a configuration
///
/// Without a broker URL the service runs against the in-process broker.
pub fn broker_from_config(config: &AppConfig) -> Result<Arc<dyn Broker>, MqttError> {
    if config.uses_memory_broker() {
        warn!("No broker URL configured, using in-memory broker");
        return Ok(Arc::new(MemoryBroker::new()));
    }
    let settings = MqttSettings::from_config(config)?;
    Ok(Arc::new(MqttBroker::new(settings)))
}

/// Owner of the broker connection lifecycle
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    reconnect: ReconnectConfig,
    state_tx: watch::Sender<ConnectionState>,
    /// Serializes connection attempts, disconnects and subscription changes
    connect_lock: Mutex<()>,
    subscriptions: std::sync::Mutex<HashMap<String, SubscribeOptions>>,
    events: broadcast::Sender<ConnectionEvent>,
    retained: TopicCache,
    reconnecting: AtomicBool,
    /// Set by the event pump when the transport drops before `Connected`;
    /// guards every move into `Connected`
    lost_during_attempt: std::sync::Mutex<bool>,
    closing: AtomicBool,
    reconnect_count: AtomicU32,
    connected_since: std::sync::Mutex<Option<Instant>>,
    last_message_at: std::sync::Mutex<Option<Instant>>,
    metrics: Option<Arc<MetricsCollector>>,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a manager for `broker`
    ///
    /// Must be called inside a Tokio runtime: the task forwarding broker events
    /// is spawned here.
    pub fn new(
        broker: Arc<dyn Broker>,
        reconnect: ReconnectConfig,
        event_capacity: usize,
    ) -> Result<Arc<Self>, MqttError> {
        Self::with_metrics(broker, reconnect, event_capacity, None)
    }

    pub fn with_metrics(
        broker: Arc<dyn Broker>,
        reconnect: ReconnectConfig,
        event_capacity: usize,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Arc<Self>, MqttError> {
        HealthMonitor::validate_connection_config(&reconnect).map_err(MqttError::ConnectionFailedStr)?;

        let broker_events = broker.take_events().ok_or_else(|| {
            MqttError::ConnectionFailedStr("broker events are already owned by another manager".to_string())
        })?;

        let (state_tx, _) = watch::channel(ConnectionState::Disconnected("not connected".to_string()));
        let (events, _) = broadcast::channel(event_capacity.max(1));

        let manager = Arc::new(Self {
            broker,
            reconnect,
            state_tx,
            connect_lock: Mutex::new(()),
            subscriptions: std::sync::Mutex::new(HashMap::new()),
            events,
            retained: TopicCache::new(),
            reconnecting: AtomicBool::new(false),
            lost_during_attempt: std::sync::Mutex::new(false),
            closing: AtomicBool::new(false),
            reconnect_count: AtomicU32::new(0),
            connected_since: std::sync::Mutex::new(None),
            last_message_at: std::sync::Mutex::new(None),
            metrics,
            pump: std::sync::Mutex::new(None),
        });

        let handle = tokio::spawn(Self::pump_broker_events(Arc::downgrade(&manager), broker_events));
        *manager.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(manager)
    }

    /// Build the broker and manager from configuration
    pub fn from_config(
        config: &AppConfig,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Result<Arc<Self>, MqttError> {
        let broker = broker_from_config(config)?;
        Self::with_metrics(
            broker,
            ReconnectConfig::from(&config.reconnect),
            config.mqtt.event_capacity,
            metrics,
        )
    }

    /// Forward broker events onto the bus and react to connection loss
    async fn pump_broker_events(
        manager: Weak<Self>,
        mut broker_events: mpsc::UnboundedReceiver<BrokerEvent>,
    ) {
        while let Some(event) = broker_events.recv().await {
            let Some(manager) = manager.upgrade() else {
                break;
            };
            match event {
                BrokerEvent::Message(message) => manager.on_message(message),
                BrokerEvent::ConnectionLost(reason) => manager.on_connection_lost(reason),
            }
        }
        debug!("Broker event pump stopped");
    }

    fn on_message(&self, message: IncomingMessage) {
        *self.last_message_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        if let Some(metrics) = &self.metrics {
            metrics.message_received();
        }
        // No receivers is fine; the router may not be started yet
        let _ = self.events.send(ConnectionEvent::Message(message));
    }

    fn on_connection_lost(self: &Arc<Self>, reason: String) {
        {
            let mut lost = self
                .lost_during_attempt
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if !matches!(self.state(), ConnectionState::Connected) {
                debug!("Connection loss before connected, failing attempt in flight: {}", reason);
                *lost = true;
                return;
            }
            self.set_state(HealthMonitor::next_state(StateTransition::Lost(reason.clone())));
        }

        *self.connected_since.lock().unwrap_or_else(|e| e.into_inner()) = None;
        if let Some(metrics) = &self.metrics {
            metrics.connection_lost();
        }
        let _ = self.events.send(ConnectionEvent::Disconnected {
            reason,
            caller_initiated: false,
        });

        self.start_reconnecting();
    }

    /// Start the background reconnect loop unless one is already running
    ///
    /// Used after an unexpected loss and by callers whose first `connect`
    /// failed and who want the service to keep trying.
    pub fn start_reconnecting(self: &Arc<Self>) {
        if self.closing.load(Ordering::SeqCst) || self.is_connected() {
            return;
        }
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            debug!("Reconnect loop already running");
            return;
        }

        tokio::spawn(Self::reconnect_loop(Arc::downgrade(self)));
    }

    async fn reconnect_loop(manager: Weak<Self>) {
        let mut attempts_made = 0u32;

        loop {
            let Some(this) = manager.upgrade() else {
                return;
            };

            let decision = HealthMonitor::should_attempt_reconnection(
                attempts_made,
                &this.reconnect,
                this.closing.load(Ordering::SeqCst),
            );

            match decision {
                ReconnectionDecision::AbortClosing => break,
                ReconnectionDecision::AbortMaxAttemptsExceeded => {
                    let reason = format!("gave up after {attempts_made} reconnect attempts");
                    this.set_state(HealthMonitor::next_state(StateTransition::GaveUp(reason.clone())));
                    let _ = this.events.send(ConnectionEvent::Disconnected {
                        reason,
                        caller_initiated: false,
                    });
                    break;
                }
                ReconnectionDecision::Proceed { attempt, delay_ms } => {
                    if !this.is_connected() {
                        this.set_state(HealthMonitor::next_state(StateTransition::ReconnectStarted(
                            attempt,
                        )));
                    }
                    drop(this);

                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

                    let Some(this) = manager.upgrade() else {
                        return;
                    };
                    if this.closing.load(Ordering::SeqCst) {
                        break;
                    }

                    match this.establish(true).await {
                        Ok(()) => {
                            this.reconnect_count.fetch_add(1, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => {
                            warn!("Reconnect attempt {} failed: {}", attempt, e);
                            attempts_made = attempt;
                        }
                    }
                }
            }
        }

        if let Some(this) = manager.upgrade() {
            this.reconnecting.store(false, Ordering::SeqCst);
        }
    }

    /// Connect to the broker
    ///
    /// Returns immediately when already connected. Concurrent calls wait for
    /// the attempt in flight instead of starting another.
    ///
    /// A transport that drops while subscriptions are being replayed fails the
    /// call with [`MqttError::ConnectionLost`] and hands over to the reconnect
    /// loop.
    pub async fn connect(self: &Arc<Self>) -> Result<(), MqttError> {
        self.closing.store(false, Ordering::SeqCst);
        let result = self.establish(false).await;
        if let Err(MqttError::ConnectionLost(reason)) = &result {
            let _ = self.events.send(ConnectionEvent::Disconnected {
                reason: reason.clone(),
                caller_initiated: false,
            });
            self.start_reconnecting();
        }
        result
    }

    async fn establish(&self, is_reconnect: bool) -> Result<(), MqttError> {
        let _guard = self.connect_lock.lock().await;

        if self.is_connected() {
            return Ok(());
        }
        if self.closing.load(Ordering::SeqCst) {
            return Err(MqttError::Closed);
        }

        if !is_reconnect {
            self.set_state(HealthMonitor::next_state(StateTransition::ConnectStarted));
        }
        if let Some(metrics) = &self.metrics {
            metrics.connection_attempt();
        }
        *self.lost_during_attempt.lock().unwrap_or_else(|e| e.into_inner()) = false;

        if let Err(e) = self.broker.connect().await {
            if let Some(metrics) = &self.metrics {
                metrics.connection_failed();
            }
            if !is_reconnect {
                self.set_state(HealthMonitor::next_state(StateTransition::ConnectFailed(
                    e.to_string(),
                )));
            }
            return Err(e);
        }

        let subscriptions: Vec<(String, SubscribeOptions)> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(topic, options)| (topic.clone(), *options))
            .collect();
        for (topic, options) in subscriptions {
            if let Err(e) = self.broker.subscribe(&topic, options).await {
                warn!("Failed to restore subscription {}: {}", topic, e);
            }
        }

        {
            let mut lost = self
                .lost_during_attempt
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if std::mem::take(&mut *lost) {
                drop(lost);
                let reason = "connection lost while restoring subscriptions".to_string();
                if let Some(metrics) = &self.metrics {
                    metrics.connection_failed();
                }
                if !is_reconnect {
                    self.set_state(HealthMonitor::next_state(StateTransition::Lost(
                        reason.clone(),
                    )));
                }
                warn!("{}", reason);
                return Err(MqttError::ConnectionLost(reason));
            }
            *self.connected_since.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
            self.set_state(HealthMonitor::next_state(StateTransition::Acknowledged));
        }

        if let Some(metrics) = &self.metrics {
            metrics.connection_established();
        }
        let _ = self.events.send(ConnectionEvent::Connected);
        Ok(())
    }

    /// Close the connection; no reconnect follows
    pub async fn disconnect(&self) -> Result<(), MqttError> {
        self.closing.store(true, Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;

        let was_closed = HealthMonitor::is_terminal(&self.state());
        let result = self.broker.disconnect().await;

        *self.connected_since.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.set_state(HealthMonitor::next_state(StateTransition::ClosedByCaller));
        if let Some(metrics) = &self.metrics {
            metrics.connection_closed();
        }
        if !was_closed {
            let _ = self.events.send(ConnectionEvent::Disconnected {
                reason: "closed by caller".to_string(),
                caller_initiated: true,
            });
        }

        info!("Disconnected from {} broker", self.broker.kind());
        result
    }

    /// Publish a payload; fails fast unless connected
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Bytes>,
        options: PublishOptions,
    ) -> Result<(), MqttError> {
        let state = self.state();
        if !HealthMonitor::can_publish(&state) {
            if let Some(metrics) = &self.metrics {
                metrics.publish_failed();
            }
            return Err(MqttError::NotConnected { state });
        }

        let payload = payload.into();
        match self.broker.publish(topic, payload.clone(), options).await {
            Ok(()) => {
                if options.retain {
                    self.retained.store(topic, payload);
                }
                if let Some(metrics) = &self.metrics {
                    metrics.message_published();
                }
                debug!("Published to {}", topic);
                Ok(())
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.publish_failed();
                }
                Err(e)
            }
        }
    }

    /// Serialize `value` as JSON and publish it
    pub async fn publish_json<T: Serialize>(
        &self,
        topic: &str,
        value: &T,
        options: PublishOptions,
    ) -> Result<(), MqttError> {
        let payload = serde_json::to_vec(value).map_err(MqttError::SerializationError)?;
        self.publish(topic, payload, options).await
    }

    /// Add a broker-level subscription
    ///
    /// The subscription is recorded even when the broker call fails or the
    /// connection is down, and is re-sent on every reconnect.
    pub async fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Result<(), MqttError> {
        let _guard = self.connect_lock.lock().await;
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.to_string(), options);

        if self.is_connected() {
            self.broker.subscribe(topic, options).await?;
            info!("Subscribed to {}", topic);
        } else {
            debug!("Recorded subscription {} for next connect", topic);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        let _guard = self.connect_lock.lock().await;
        let removed = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(topic)
            .is_some();

        if removed && self.is_connected() {
            self.broker.unsubscribe(topic).await?;
            info!("Unsubscribed from {}", topic);
        }
        Ok(())
    }

    /// New receiver on the event bus
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    /// Watch state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.state_tx.borrow(), ConnectionState::Connected)
    }

    /// Wait until the state satisfies `predicate`, up to `timeout`
    pub async fn wait_for_state<F>(&self, predicate: F, timeout: Duration) -> bool
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = self.state_tx.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(predicate)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Last retained payload published or received on `topic`
    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.retained.get(topic)
    }

    pub fn retained_cache(&self) -> &TopicCache {
        &self.retained
    }

    /// Recorded broker-level subscriptions, sorted
    pub fn subscriptions(&self) -> Vec<String> {
        let mut topics: Vec<String> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
    }

    pub fn broker_kind(&self) -> &'static str {
        self.broker.kind()
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> Option<&Arc<MetricsCollector>> {
        self.metrics.as_ref()
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        HealthMonitor::calculate_health_metrics(
            *self.connected_since.lock().unwrap_or_else(|e| e.into_inner()),
            *self.last_message_at.lock().unwrap_or_else(|e| e.into_inner()),
            self.reconnect_count(),
        )
    }

    fn set_state(&self, new_state: ConnectionState) {
        let old_state = self.state_tx.send_replace(new_state.clone());
        if old_state != new_state {
            HealthMonitor::log_state_transition(&old_state, &new_state);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}
