//! rumqttc-backed broker connection
//!
//! Each [`Broker::connect`] call builds a fresh rumqttc client and event loop,
//! spawns a poll task and waits for the ConnAck. The poll task forwards inbound
//! publishes and stops at the first connection error; reconnect policy belongs
//! to the connection manager.

use super::connection::{configure_mqtt_options, to_rumqttc_qos, ConnectionState, MqttError, MqttSettings};
use super::message_handler::{EventClassifier, EventRoute};
use crate::transport::{Broker, BrokerEvent, PublishOptions, RetainHandling, SubscribeOptions};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Filter, RetainForwardRule};
use rumqttc::v5::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Requests buffered by rumqttc between the client handle and the event loop
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Time allowed for the poll task to stop after a disconnect
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// MQTT v5 broker connection
pub struct MqttBroker {
    settings: MqttSettings,
    client: Arc<Mutex<Option<AsyncClient>>>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<BrokerEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<BrokerEvent>>>,
}

impl MqttBroker {
    pub fn new(settings: MqttSettings) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            client: Arc::new(Mutex::new(None)),
            poll_handle: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    /// Clone the live client handle, or fail when there is no connection
    async fn current_client(&self) -> Result<AsyncClient, MqttError> {
        self.client
            .lock()
            .await
            .clone()
            .ok_or_else(|| MqttError::NotConnected {
                state: ConnectionState::Disconnected("no broker connection".to_string()),
            })
    }

    /// Stop a previous poll task before a new connection replaces it
    async fn stop_poll_task(&self) {
        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.abort();
        }
    }

    /// Drive the rumqttc event loop until the connection fails
    async fn run_event_loop(
        mut event_loop: EventLoop,
        ack_tx: oneshot::Sender<Result<(), String>>,
        events: mpsc::UnboundedSender<BrokerEvent>,
        closing: Arc<AtomicBool>,
        broker_addr: String,
    ) {
        let mut ack_tx = Some(ack_tx);

        loop {
            match event_loop.poll().await {
                Ok(event) => match EventClassifier::classify(&event) {
                    EventRoute::ConnectionAcknowledged => {
                        if let Some(tx) = ack_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    EventRoute::MessageReceived(message) => {
                        debug!(target: "mqtt_transport", "Received message on topic: {}", message.topic);
                        if events.send(BrokerEvent::Message(message)).is_err() {
                            debug!(target: "mqtt_transport", "Event receiver dropped, stopping poll loop");
                            break;
                        }
                    }
                    EventRoute::Disconnected(reason) => {
                        Self::report_loss(&events, &closing, reason);
                        break;
                    }
                    EventRoute::SubscriptionAcknowledged { packet_id, rejected } => {
                        if rejected > 0 {
                            warn!(
                                "Broker rejected {} filter(s) in subscription {}",
                                rejected, packet_id
                            );
                        } else {
                            debug!(target: "mqtt_transport", "Subscription {} acknowledged", packet_id);
                        }
                    }
                    EventRoute::InfrastructureEvent(detail) => {
                        debug!(target: "mqtt_transport", "MQTT event: {}", detail);
                    }
                    EventRoute::OutgoingEvent => {}
                },
                Err(e) => {
                    if let Some(tx) = ack_tx.take() {
                        let _ = tx.send(Err(e.to_string()));
                    } else {
                        Self::report_loss(&events, &closing, e.to_string());
                    }
                    break;
                }
            }
        }

        debug!(target: "mqtt_transport", "Poll loop stopped for {}", broker_addr);
    }

    fn report_loss(
        events: &mpsc::UnboundedSender<BrokerEvent>,
        closing: &AtomicBool,
        reason: String,
    ) {
        if closing.load(Ordering::SeqCst) {
            debug!(target: "mqtt_transport", "Connection ended during close: {}", reason);
            return;
        }
        error!("MQTT connection lost: {}", reason);
        let _ = events.send(BrokerEvent::ConnectionLost(reason));
    }
}

fn to_filter(topic: &str, options: SubscribeOptions) -> Filter {
    Filter {
        path: topic.to_string(),
        qos: to_rumqttc_qos(options.qos),
        nolocal: options.no_local,
        preserve_retain: false,
        retain_forward_rule: match options.retain_handling {
            RetainHandling::SendOnSubscribe => RetainForwardRule::OnEverySubscribe,
            RetainHandling::SendOnNewSubscription => RetainForwardRule::OnNewSubscribe,
            RetainHandling::DoNotSend => RetainForwardRule::Never,
        },
    }
}

#[async_trait]
impl Broker for MqttBroker {
    async fn connect(&self) -> Result<(), MqttError> {
        self.closing.store(false, Ordering::SeqCst);
        self.stop_poll_task().await;

        let broker_addr = format!("{}:{}", self.settings.host, self.settings.port);
        info!(
            "Connecting to MQTT broker {} as {}",
            broker_addr, self.settings.client_id
        );

        let mqtt_options = configure_mqtt_options(&self.settings);
        let (client, event_loop) = AsyncClient::new(mqtt_options, CLIENT_CHANNEL_CAPACITY);
        let (ack_tx, ack_rx) = oneshot::channel();

        let handle = tokio::spawn(Self::run_event_loop(
            event_loop,
            ack_tx,
            self.events_tx.clone(),
            self.closing.clone(),
            broker_addr.clone(),
        ));

        let acknowledged = match tokio::time::timeout(self.settings.connect_timeout, ack_rx).await
        {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(MqttError::ConnectionFailedStr(reason)),
            Ok(Err(_)) => Err(MqttError::ConnectionFailedStr(
                "Poll task ended before ConnAck".to_string(),
            )),
            Err(_) => Err(MqttError::ConnectionFailedStr(
                "ConnAck timeout - no connection confirmation received".to_string(),
            )),
        };

        if let Err(e) = acknowledged {
            handle.abort();
            return Err(e);
        }

        *self.client.lock().await = Some(client);
        *self.poll_handle.lock().await = Some(handle);
        info!("Connected to MQTT broker {}", broker_addr);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        self.closing.store(true, Ordering::SeqCst);

        let client = self.client.lock().await.take();
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                warn!("MQTT disconnect request failed: {}", e);
            }
        }

        let handle = self.poll_handle.lock().await.take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(())) => info!("MQTT poll task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => warn!("MQTT poll task ended with error: {}", e),
                Err(_) => {
                    warn!("MQTT poll task didn't stop in time, aborting");
                    abort.abort();
                }
                _ => {}
            }
        }

        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<(), MqttError> {
        let client = self.current_client().await?;
        client
            .publish(topic.to_string(), to_rumqttc_qos(options.qos), options.retain, payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    async fn subscribe(&self, topic: &str, options: SubscribeOptions) -> Result<(), MqttError> {
        let client = self.current_client().await?;
        client
            .subscribe_many(vec![to_filter(topic, options)])
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        let client = self.current_client().await?;
        client
            .unsubscribe(topic.to_string())
            .await
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<BrokerEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    fn kind(&self) -> &'static str {
        "mqtt"
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        if let Ok(mut handle) = self.poll_handle.try_lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
    }
}
