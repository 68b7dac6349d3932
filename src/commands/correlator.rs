//! Command correlator
//!
//! Every outstanding command lives in one map keyed by `commandId`. Whoever
//! removes the entry from the map (response, timer, publish failure or
//! cancel) owns the resolution; the removal happens under the map lock, so a
//! command resolves exactly once and any later signal finds nothing to do.
//! A response only counts when it arrives on the response topic of the device
//! the command was sent to.

use super::{CommandOutcome, CommandTarget, PendingCommandInfo};
use crate::command_span;
use crate::observability::MetricsCollector;
use crate::protocol::{CommandEnvelope, CommandResponse, TopicBuilder};
use crate::routing::{HandlerError, HandlerId, InboundMessage, MessageHandler, MessageRouter, RouterError};
use crate::transport::{ConnectionManager, PublishOptions};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

struct PendingCommand {
    info: PendingCommandInfo,
    started: Instant,
    resolve: oneshot::Sender<CommandOutcome>,
    timer: Option<JoinHandle<()>>,
}

/// Handle to a dispatched command
#[derive(Debug)]
pub struct CommandTicket {
    command_id: Uuid,
    receiver: oneshot::Receiver<CommandOutcome>,
}

impl CommandTicket {
    pub fn command_id(&self) -> Uuid {
        self.command_id
    }

    /// Wait for the command to resolve
    ///
    /// A correlator dropped while the command is outstanding reads as
    /// [`CommandOutcome::Cancelled`].
    pub async fn outcome(self) -> CommandOutcome {
        self.receiver.await.unwrap_or(CommandOutcome::Cancelled)
    }
}

/// Issues commands and matches device responses to them
pub struct CommandCorrelator {
    manager: Arc<ConnectionManager>,
    topics: TopicBuilder,
    default_timeout: Duration,
    pending: Mutex<HashMap<Uuid, PendingCommand>>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl CommandCorrelator {
    pub fn new(
        manager: Arc<ConnectionManager>,
        topics: TopicBuilder,
        default_timeout: Duration,
    ) -> Arc<Self> {
        let metrics = manager.metrics().cloned();
        Arc::new(Self {
            manager,
            topics,
            default_timeout,
            pending: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<Uuid, PendingCommand>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send a command and wait for its outcome
    pub async fn send_command(
        self: &Arc<Self>,
        target: CommandTarget,
        command: &str,
        parameters: Value,
        timeout: Option<Duration>,
    ) -> CommandOutcome {
        self.dispatch_command(target, command, parameters, timeout)
            .await
            .outcome()
            .await
    }

    /// Publish a command and return a ticket for its outcome
    ///
    /// The pending entry and its timer exist before the publish is attempted,
    /// so a response can never arrive ahead of its registration. A failed
    /// publish resolves the ticket immediately.
    pub async fn dispatch_command(
        self: &Arc<Self>,
        target: CommandTarget,
        command: &str,
        parameters: Value,
        timeout: Option<Duration>,
    ) -> CommandTicket {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let mut envelope = CommandEnvelope::new(command, parameters);
        let (resolve, receiver) = oneshot::channel();

        {
            let mut pending = self.lock_pending();
            while pending.contains_key(&envelope.command_id) {
                envelope.command_id = Uuid::new_v4();
            }
            pending.insert(
                envelope.command_id,
                PendingCommand {
                    info: PendingCommandInfo {
                        command_id: envelope.command_id,
                        target: target.clone(),
                        command: envelope.command.clone(),
                        parameters: envelope.parameters.clone(),
                        issued_at: envelope.issued_at,
                        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    },
                    started: Instant::now(),
                    resolve,
                    timer: None,
                },
            );
        }
        let command_id = envelope.command_id;

        let timer = tokio::spawn(Self::expire_after(Arc::downgrade(self), command_id, timeout));
        match self.lock_pending().get_mut(&command_id) {
            Some(entry) => entry.timer = Some(timer),
            None => timer.abort(),
        }

        let span = command_span!(
            command_id = %command_id,
            command = %envelope.command,
            device_id = %target.device_id
        );
        let topic = self
            .topics
            .device_commands(&target.site_id, &target.device_id);
        let published = self
            .manager
            .publish_json(&topic, &envelope, PublishOptions::at_least_once())
            .instrument(span.clone())
            .await;

        let _entered = span.enter();
        match published {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.command_sent();
                }
                info!(
                    "Sent command {} to {} (timeout {}ms)",
                    envelope.command,
                    topic,
                    timeout.as_millis()
                );
            }
            Err(e) => {
                warn!("Failed to publish command {}: {}", envelope.command, e);
                self.resolve(
                    command_id,
                    CommandOutcome::PublishFailed {
                        reason: e.to_string(),
                    },
                );
            }
        }

        CommandTicket {
            command_id,
            receiver,
        }
    }

    async fn expire_after(correlator: Weak<Self>, command_id: Uuid, timeout: Duration) {
        tokio::time::sleep(timeout).await;
        let Some(correlator) = correlator.upgrade() else {
            return;
        };
        if correlator.resolve(command_id, CommandOutcome::TimedOut { after: timeout }) {
            warn!(
                "Command {} timed out after {}ms",
                command_id,
                timeout.as_millis()
            );
        }
    }

    /// Settle a pending command; false when it was already settled
    fn resolve(&self, command_id: Uuid, outcome: CommandOutcome) -> bool {
        self.resolve_where(command_id, outcome, |_| true)
    }

    /// Remove and resolve the entry if `accept` holds for it
    fn resolve_where<F>(&self, command_id: Uuid, outcome: CommandOutcome, accept: F) -> bool
    where
        F: FnOnce(&PendingCommandInfo) -> bool,
    {
        let entry = {
            let mut pending = self.lock_pending();
            match pending.get(&command_id) {
                Some(entry) if accept(&entry.info) => pending.remove(&command_id),
                _ => None,
            }
        };
        let Some(entry) = entry else {
            return false;
        };

        if let Some(timer) = entry.timer {
            timer.abort();
        }

        if let Some(metrics) = &self.metrics {
            match &outcome {
                CommandOutcome::Completed { .. } => {
                    metrics.command_completed(entry.started.elapsed())
                }
                CommandOutcome::TimedOut { .. } => metrics.command_timed_out(),
                CommandOutcome::PublishFailed { .. } => metrics.command_publish_failed(),
                CommandOutcome::Cancelled => metrics.command_cancelled(),
            }
        }

        debug!(
            "Command {} ({}) resolved as {}",
            command_id,
            entry.info.command,
            outcome.label()
        );
        if entry.resolve.send(outcome).is_err() {
            debug!("Caller stopped waiting for command {}", command_id);
        }
        true
    }

    /// Resolve the command a device response refers to
    ///
    /// `site_id` and `device_id` name the device whose response topic carried
    /// the message. Returns false for responses to unknown, timed-out or
    /// cancelled commands and for responses from another device; those are
    /// logged and dropped.
    pub fn handle_response(
        &self,
        site_id: &str,
        device_id: &str,
        response: CommandResponse,
    ) -> bool {
        let command_id = response.command_id;
        let outcome = CommandOutcome::Completed {
            success: response.success,
            response: response.payload(),
        };
        let from_target = |info: &PendingCommandInfo| {
            info.target.site_id == site_id && info.target.device_id == device_id
        };

        if self.resolve_where(command_id, outcome, from_target) {
            return true;
        }

        let expected = self
            .lock_pending()
            .get(&command_id)
            .map(|entry| entry.info.target.clone());
        if let Some(target) = expected {
            warn!(
                "Ignoring response for command {} from {}/{}; it was sent to {}/{}",
                command_id, site_id, device_id, target.site_id, target.device_id
            );
            return false;
        }

        debug!("Ignoring response for unknown or settled command {}", command_id);
        if let Some(metrics) = &self.metrics {
            metrics.late_response();
        }
        false
    }

    /// Drop a pending command; any later response is ignored
    pub fn cancel(&self, command_id: Uuid) -> bool {
        self.resolve(command_id, CommandOutcome::Cancelled)
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Outstanding commands, oldest first
    pub fn pending_commands(&self) -> Vec<PendingCommandInfo> {
        let mut commands: Vec<PendingCommandInfo> = self
            .lock_pending()
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        commands.sort_by_key(|info| info.issued_at);
        commands
    }

    /// Route device responses on `{root}/+/devices/+/commands/response` here
    pub async fn register_response_handler(
        self: &Arc<Self>,
        router: &MessageRouter,
    ) -> Result<HandlerId, RouterError> {
        router
            .add_handler(
                &self.topics.command_response_pattern(),
                Arc::new(CommandResponseHandler::new(self.clone())),
            )
            .await
    }
}

impl Drop for CommandCorrelator {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(|e| e.into_inner());
        for (_, entry) in pending.drain() {
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }
}

/// Feeds command responses from the router into a correlator
pub struct CommandResponseHandler {
    correlator: Arc<CommandCorrelator>,
}

impl CommandResponseHandler {
    pub fn new(correlator: Arc<CommandCorrelator>) -> Self {
        Self { correlator }
    }
}

#[async_trait]
impl MessageHandler for CommandResponseHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        let site_id = message.require_param("siteId")?;
        let device_id = message.require_param("deviceId")?;
        let response: CommandResponse = message
            .payload
            .parse()
            .map_err(HandlerError::InvalidPayload)?;
        self.correlator.handle_response(site_id, device_id, response);
        Ok(())
    }

    fn name(&self) -> &str {
        "command-response"
    }
}
