//! Message router
//!
//! Registrations are kept in a list guarded by a std `RwLock`; dispatch takes a
//! snapshot of the matching handlers and never holds the lock across an await.
//! A single dispatch task consumes the connection manager's event bus, so
//! messages on one topic reach handlers in transport order.

use super::{HandlerError, InboundMessage, MessageHandler, RouterError};
use crate::observability::MetricsCollector;
use crate::protocol::{self, DecodedPayload};
use crate::transport::{ConnectionEvent, ConnectionManager, IncomingMessage, SubscribeOptions};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Identifies one handler registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

impl HandlerId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

struct Registration {
    id: HandlerId,
    pattern: String,
    /// Broker-level topic derived from the pattern
    subscription: String,
    handler: Arc<dyn MessageHandler>,
}

/// Dispatches inbound messages to handlers by topic pattern
pub struct MessageRouter {
    manager: Arc<ConnectionManager>,
    registrations: RwLock<Vec<Registration>>,
    /// Serializes add/remove so subscribe decisions see a stable registration set
    registration_lock: Mutex<()>,
    subscribe_options: SubscribeOptions,
    next_id: AtomicU64,
    metrics: Option<Arc<MetricsCollector>>,
    dispatch_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MessageRouter {
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<Self> {
        let metrics = manager.metrics().cloned();
        Arc::new(Self {
            manager,
            registrations: RwLock::new(Vec::new()),
            registration_lock: Mutex::new(()),
            subscribe_options: SubscribeOptions::default(),
            next_id: AtomicU64::new(1),
            metrics,
            dispatch_task: std::sync::Mutex::new(None),
        })
    }

    /// Register `handler` for `pattern`
    ///
    /// Subscribes the derived broker topic unless another registration
    /// already covers it.
    pub async fn add_handler(
        &self,
        pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<HandlerId, RouterError> {
        protocol::validate_pattern(pattern)?;
        let subscription = protocol::subscription_topic(pattern);

        let _guard = self.registration_lock.lock().await;

        let already_subscribed = self
            .read_registrations()
            .iter()
            .any(|r| r.subscription == subscription);

        if !already_subscribed {
            if let Err(e) = self
                .manager
                .subscribe(&subscription, self.subscribe_options)
                .await
            {
                if let Err(cleanup) = self.manager.unsubscribe(&subscription).await {
                    debug!("Cleanup unsubscribe for {} failed: {}", subscription, cleanup);
                }
                return Err(e.into());
            }
        }

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        info!(
            "Registered handler {} for {} (subscription {})",
            handler.name(),
            pattern,
            subscription
        );

        self.registrations
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Registration {
                id,
                pattern: pattern.to_string(),
                subscription,
                handler,
            });

        Ok(id)
    }

    /// Withdraw a registration; returns false for unknown ids
    ///
    /// The broker subscription is dropped with the last registration using it.
    pub async fn remove_handler(&self, id: HandlerId) -> Result<bool, RouterError> {
        let _guard = self.registration_lock.lock().await;

        let (removed, still_used) = {
            let mut registrations = self.registrations.write().unwrap_or_else(|e| e.into_inner());
            let Some(index) = registrations.iter().position(|r| r.id == id) else {
                return Ok(false);
            };
            let removed = registrations.remove(index);
            let still_used = registrations
                .iter()
                .any(|r| r.subscription == removed.subscription);
            (removed, still_used)
        };

        info!("Removed handler {} for {}", removed.handler.name(), removed.pattern);

        if !still_used {
            self.manager.unsubscribe(&removed.subscription).await?;
        }
        Ok(true)
    }

    /// Start consuming the connection manager's event bus
    ///
    /// The bus receiver is created before this returns, so no message
    /// published afterwards is missed. Calling it again is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.dispatch_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        let events = self.manager.events();
        *task = Some(tokio::spawn(Self::dispatch_loop(Arc::downgrade(self), events)));
        info!("Message router started");
    }

    pub fn stop(&self) {
        if let Some(task) = self
            .dispatch_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
            info!("Message router stopped");
        }
    }

    async fn dispatch_loop(router: Weak<Self>, mut events: broadcast::Receiver<ConnectionEvent>) {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Message(message)) => {
                    let Some(router) = router.upgrade() else {
                        break;
                    };
                    router.dispatch(message).await;
                }
                Ok(ConnectionEvent::Connected) => debug!("Router observed broker connect"),
                Ok(ConnectionEvent::Disconnected { reason, .. }) => {
                    debug!("Router observed broker disconnect: {}", reason)
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Router lagged behind the event bus, {} message(s) skipped", skipped);
                    if let Some(metrics) = router.upgrade().and_then(|r| r.metrics.clone()) {
                        metrics.events_lagged(skipped);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Router dispatch loop ended");
    }

    /// Deliver one message to every matching handler
    ///
    /// Returns the number of handlers invoked. A handler registered under
    /// several matching patterns is invoked once, with the parameters of its
    /// first registration.
    pub async fn dispatch(&self, message: IncomingMessage) -> usize {
        if message.retain {
            self.manager
                .retained_cache()
                .store(&message.topic, message.payload.clone());
        }

        let payload = DecodedPayload::decode(&message.payload);
        if matches!(payload, DecodedPayload::Raw(_)) {
            debug!("Payload on {} is not JSON, passing raw bytes", message.topic);
            if let Some(metrics) = &self.metrics {
                metrics.raw_payload_received();
            }
        }

        let targets = self.matching_handlers(&message.topic);
        if targets.is_empty() {
            debug!("No handler matched topic {}", message.topic);
        }

        for (pattern, params, handler) in &targets {
            let inbound = InboundMessage {
                topic: message.topic.clone(),
                payload: payload.clone(),
                params: params.clone(),
                retained: message.retain,
                qos: message.qos,
            };
            self.invoke(pattern, handler, &inbound).await;
        }

        if let Some(metrics) = &self.metrics {
            metrics.message_dispatched(targets.len());
        }
        targets.len()
    }

    fn matching_handlers(
        &self,
        topic: &str,
    ) -> Vec<(String, protocol::TopicParams, Arc<dyn MessageHandler>)> {
        let registrations = self.read_registrations();
        let mut targets: Vec<(String, protocol::TopicParams, Arc<dyn MessageHandler>)> = Vec::new();

        for registration in registrations.iter() {
            let Some(params) = protocol::extract(&registration.pattern, topic) else {
                continue;
            };
            let seen = targets
                .iter()
                .any(|(_, _, handler)| Arc::ptr_eq(handler, &registration.handler));
            if !seen {
                targets.push((registration.pattern.clone(), params, registration.handler.clone()));
            }
        }
        targets
    }

    async fn invoke(&self, pattern: &str, handler: &Arc<dyn MessageHandler>, message: &InboundMessage) {
        let outcome = AssertUnwindSafe(handler.handle(message)).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                Self::log_handler_error(handler.name(), &message.topic, &e);
                if let Some(metrics) = &self.metrics {
                    metrics.handler_failed();
                }
            }
            Err(_) => {
                error!(
                    "Handler {} panicked on {} (pattern {})",
                    handler.name(),
                    message.topic,
                    pattern
                );
                if let Some(metrics) = &self.metrics {
                    metrics.handler_panicked();
                }
            }
        }
    }

    fn log_handler_error(handler: &str, topic: &str, error: &HandlerError) {
        match error {
            HandlerError::InvalidPayload(_) | HandlerError::UnknownDevice(_) => {
                warn!("Handler {} rejected message on {}: {}", handler, topic, error)
            }
            _ => error!("Handler {} failed on {}: {}", handler, topic, error),
        }
    }

    fn read_registrations(&self) -> std::sync::RwLockReadGuard<'_, Vec<Registration>> {
        self.registrations.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn handler_count(&self) -> usize {
        self.read_registrations().len()
    }

    /// Registered patterns in registration order
    pub fn patterns(&self) -> Vec<String> {
        self.read_registrations()
            .iter()
            .map(|r| r.pattern.clone())
            .collect()
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }
}

impl Drop for MessageRouter {
    fn drop(&mut self) {
        self.stop();
    }
}
