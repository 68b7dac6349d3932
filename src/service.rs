//! Service lifecycle: wiring, startup and graceful shutdown
//!
//! Startup order matters: the router starts consuming the event bus and all
//! handlers are registered before the first connect, so the subscriptions are
//! part of the initial replay and no early message is missed.

use crate::collaborators::{AuditLog, DevicePersistence, ReadingBroadcaster};
use crate::commands::CommandCorrelator;
use crate::config::AppConfig;
use crate::error::{EmsError, EmsResult};
use crate::gateway::GatewayManager;
use crate::handlers::{self, HandlerContext, SystemStatusHandler};
use crate::observability::{HealthServer, MetricsCollector};
use crate::protocol::{SystemStatusType, TopicBuilder};
use crate::routing::MessageRouter;
use crate::transport::manager::broker_from_config;
use crate::transport::{
    Broker, ConnectionEvent, ConnectionManager, ConnectionState, ReconnectConfig,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// External collaborators injected into the service
#[derive(Clone)]
pub struct Collaborators {
    pub persistence: Arc<dyn DevicePersistence>,
    pub broadcaster: Arc<dyn ReadingBroadcaster>,
    pub audit: Arc<dyn AuditLog>,
}

/// The assembled messaging core
pub struct MessagingService {
    config: AppConfig,
    topics: TopicBuilder,
    metrics: Arc<MetricsCollector>,
    connection: Arc<ConnectionManager>,
    router: Arc<MessageRouter>,
    correlator: Arc<CommandCorrelator>,
    gateways: Arc<GatewayManager>,
    collaborators: Collaborators,
    system_status: Option<Arc<SystemStatusHandler>>,
    status_task: Option<JoinHandle<()>>,
    health_task: Option<JoinHandle<()>>,
}

impl MessagingService {
    /// Build the service with the broker selected by configuration
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(config: AppConfig, collaborators: Collaborators) -> EmsResult<Self> {
        let broker = broker_from_config(&config)?;
        Self::with_broker(config, broker, collaborators)
    }

    /// Build the service around an existing broker
    pub fn with_broker(
        config: AppConfig,
        broker: Arc<dyn Broker>,
        collaborators: Collaborators,
    ) -> EmsResult<Self> {
        config.validate()?;

        let metrics = Arc::new(MetricsCollector::new());
        metrics.set_service_state("initializing");

        let topics = TopicBuilder::new(&config.mqtt.topic_root);
        let connection = ConnectionManager::with_metrics(
            broker,
            ReconnectConfig::from(&config.reconnect),
            config.mqtt.event_capacity,
            Some(metrics.clone()),
        )?;
        let router = MessageRouter::new(connection.clone());
        let correlator = CommandCorrelator::new(
            connection.clone(),
            topics.clone(),
            config.commands.default_timeout(),
        );
        let gateways = Arc::new(GatewayManager::new(
            collaborators.persistence.clone(),
            collaborators.audit.clone(),
            topics.clone(),
            &config.gateways,
            Some(metrics.clone()),
        ));

        Ok(Self {
            config,
            topics,
            metrics,
            connection,
            router,
            correlator,
            gateways,
            collaborators,
            system_status: None,
            status_task: None,
            health_task: None,
        })
    }

    /// Register handlers, connect and start the background tasks
    ///
    /// A failed first connect is not fatal: it is logged and handed to the
    /// reconnect loop.
    pub async fn start(&mut self) -> EmsResult<()> {
        info!("Starting messaging service {}", self.config.service.id);
        self.metrics.set_service_state("starting");

        self.router.start();

        let context = HandlerContext::new(
            self.collaborators.persistence.clone(),
            self.collaborators.broadcaster.clone(),
        )
        .with_metrics(self.metrics.clone());
        let registered =
            handlers::register_all(&self.router, &self.topics, context, self.gateways.clone())
                .await?;
        self.system_status = Some(registered.system_status);
        self.correlator
            .register_response_handler(&self.router)
            .await?;

        self.status_task = Some(tokio::spawn(Self::announce_on_connect(
            self.connection.clone(),
            self.connection.events(),
            self.topics.clone(),
            self.config.service.id.clone(),
        )));

        match self.connection.connect().await {
            Ok(()) => info!(
                "Connected to {} broker",
                self.connection.broker_kind()
            ),
            Err(e) => {
                warn!("Initial broker connection failed, retrying in background: {}", e);
                self.connection.start_reconnecting();
            }
        }

        self.gateways.start_heartbeat_monitor();

        if let Some(port) = self.config.health.port {
            let server = Arc::new(HealthServer::new(
                self.config.service.id.clone(),
                port,
                self.connection.clone(),
                self.gateways.clone(),
                self.metrics.clone(),
            ));
            self.health_task = Some(tokio::spawn(server.start()));
        }

        self.metrics.set_service_state("running");
        info!("Messaging service started");
        Ok(())
    }

    /// Publish the online status every time the connection comes up
    async fn announce_on_connect(
        connection: Arc<ConnectionManager>,
        mut events: broadcast::Receiver<ConnectionEvent>,
        topics: TopicBuilder,
        service_id: String,
    ) {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Connected) => {
                    match handlers::publish_system_status(
                        &connection,
                        &topics,
                        &service_id,
                        SystemStatusType::Online,
                    )
                    .await
                    {
                        Ok(()) => info!(service_id = %service_id, "Published online status"),
                        Err(e) => error!(
                            service_id = %service_id,
                            error = %e,
                            "Failed to publish online status"
                        ),
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Status task skipped {} bus event(s)", skipped)
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    /// Resolve once the connection is permanently closed
    pub async fn closed(&self) {
        let mut states = self.connection.state_changes();
        loop {
            if matches!(*states.borrow_and_update(), ConnectionState::Closed(_)) {
                return;
            }
            if states.changed().await.is_err() {
                return;
            }
        }
    }

    /// Announce offline, stop background tasks and disconnect
    pub async fn shutdown(&mut self) -> EmsResult<()> {
        info!("Shutting down messaging service {}", self.config.service.id);
        self.metrics.set_service_state("stopping");

        self.gateways.stop_heartbeat_monitor();

        if let Some(handle) = self.status_task.take() {
            handle.abort();
        }

        if self.connection.is_connected() {
            if let Err(e) = handlers::publish_system_status(
                &self.connection,
                &self.topics,
                &self.config.service.id,
                SystemStatusType::Offline,
            )
            .await
            {
                warn!("Failed to publish offline status: {}", e);
            }
        }

        let pending = self.correlator.pending_count();
        if pending > 0 {
            warn!("{} command(s) still pending at shutdown", pending);
        }

        self.router.stop();
        let result = self.connection.disconnect().await;

        if let Some(handle) = self.health_task.take() {
            handle.abort();
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("Health server shutdown error: {}", e);
                }
            }
        }

        self.metrics.set_service_state("stopped");
        info!("Messaging service shutdown complete");
        result.map_err(EmsError::from)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn topics(&self) -> &TopicBuilder {
        &self.topics
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn correlator(&self) -> &Arc<CommandCorrelator> {
        &self.correlator
    }

    pub fn gateways(&self) -> &Arc<GatewayManager> {
        &self.gateways
    }

    /// Service status tracker; available after `start`
    pub fn system_status(&self) -> Option<&Arc<SystemStatusHandler>> {
        self.system_status.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SystemStatus;
    use crate::testing::{InMemoryPersistence, MemoryAuditLog, RecordingBroadcaster};
    use crate::transport::MemoryBroker;
    use std::time::Duration;

    fn collaborators() -> Collaborators {
        Collaborators {
            persistence: Arc::new(InMemoryPersistence::new()),
            broadcaster: Arc::new(RecordingBroadcaster::new()),
            audit: Arc::new(MemoryAuditLog::new()),
        }
    }

    async fn wait_for_online(service: &MessagingService) -> Option<SystemStatus> {
        let topic = service.topics().system_status();
        for _ in 0..50 {
            if let Some(payload) = service.connection().retained(&topic) {
                return serde_json::from_slice(&payload).ok();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_start_registers_handlers_and_announces() {
        let broker = Arc::new(MemoryBroker::new());
        let mut service =
            MessagingService::with_broker(AppConfig::test_config(), broker.clone(), collaborators())
                .unwrap();

        service.start().await.unwrap();

        assert!(service.connection().is_connected());
        assert_eq!(service.router().handler_count(), 6);
        let status = wait_for_online(&service).await.unwrap();
        assert_eq!(status.status, SystemStatusType::Online);
        assert_eq!(status.service_id, service.config().service.id);
        assert_eq!(service.metrics().get_metrics().lifecycle.current_state, "running");

        service.shutdown().await.unwrap();
        let offline: SystemStatus = serde_json::from_slice(
            &broker
                .retained_payload(&service.topics().system_status())
                .unwrap(),
        )
        .unwrap();
        assert_eq!(offline.status, SystemStatusType::Offline);
        assert!(matches!(service.connection().state(), ConnectionState::Closed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_connect_retries_in_background() {
        let broker = Arc::new(MemoryBroker::new());
        broker.fail_next_connects(1);
        let mut service =
            MessagingService::with_broker(AppConfig::test_config(), broker.clone(), collaborators())
                .unwrap();

        service.start().await.unwrap();
        assert!(!service.connection().is_connected());

        let connected = service
            .connection()
            .wait_for_state(|s| matches!(s, ConnectionState::Connected), Duration::from_secs(30))
            .await;
        assert!(connected);
        assert_eq!(broker.connect_attempts(), 2);

        service.shutdown().await.unwrap();
    }
}
