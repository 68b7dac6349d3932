//! Business handlers for device, site and gateway traffic
//!
//! Each handler validates one kind of inbound message and hands the result to
//! the collaborators. Handlers never touch the broker connection themselves.

use crate::collaborators::{DevicePersistence, ReadingBroadcaster};
use crate::gateway::GatewayManager;
use crate::observability::MetricsCollector;
use crate::protocol::{SystemStatus, SystemStatusType, TopicBuilder};
use crate::routing::{HandlerError, HandlerId, MessageRouter, RouterError};
use crate::transport::{ConnectionManager, MqttError, PublishOptions, QoS};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

pub mod status;
pub mod telemetry;

pub use status::{DeviceStatusHandler, GatewayHeartbeatHandler, SystemStatusHandler};
pub use telemetry::{EnergyHandler, TelemetryHandler};

/// Collaborators shared by the handlers
#[derive(Clone)]
pub struct HandlerContext {
    pub persistence: Arc<dyn DevicePersistence>,
    pub broadcaster: Arc<dyn ReadingBroadcaster>,
    pub metrics: Option<Arc<MetricsCollector>>,
}

impl HandlerContext {
    pub fn new(
        persistence: Arc<dyn DevicePersistence>,
        broadcaster: Arc<dyn ReadingBroadcaster>,
    ) -> Self {
        Self {
            persistence,
            broadcaster,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Count a rejected reading and build the error for it
    pub(crate) fn reject(&self, reason: String) -> HandlerError {
        if let Some(metrics) = &self.metrics {
            metrics.reading_rejected();
        }
        HandlerError::InvalidPayload(reason)
    }
}

/// Handlers registered by [`register_all`]
pub struct RegisteredHandlers {
    pub ids: Vec<HandlerId>,
    pub system_status: Arc<SystemStatusHandler>,
}

/// Register every business handler on `router`
pub async fn register_all(
    router: &MessageRouter,
    topics: &TopicBuilder,
    context: HandlerContext,
    gateways: Arc<GatewayManager>,
) -> Result<RegisteredHandlers, RouterError> {
    let system_status = Arc::new(SystemStatusHandler::new());

    let ids = vec![
        router
            .add_handler(
                &topics.telemetry_pattern(),
                Arc::new(TelemetryHandler::new(context.clone())),
            )
            .await?,
        router
            .add_handler(
                &topics.status_pattern(),
                Arc::new(DeviceStatusHandler::new(context.clone())),
            )
            .await?,
        router
            .add_handler(
                &topics.energy_pattern(),
                Arc::new(EnergyHandler::new(context)),
            )
            .await?,
        router
            .add_handler(&topics.system_status(), system_status.clone())
            .await?,
        router
            .add_handler(
                &topics.gateway_heartbeat_pattern(),
                Arc::new(GatewayHeartbeatHandler::new(gateways)),
            )
            .await?,
    ];

    info!("Registered {} message handlers", ids.len());
    Ok(RegisteredHandlers { ids, system_status })
}

/// Publish this service's status, retained so late subscribers see it
pub async fn publish_system_status(
    manager: &ConnectionManager,
    topics: &TopicBuilder,
    service_id: &str,
    status: SystemStatusType,
) -> Result<(), MqttError> {
    let message = SystemStatus {
        service_id: service_id.to_string(),
        status,
        timestamp: Utc::now(),
    };
    manager
        .publish_json(
            &topics.system_status(),
            &message,
            PublishOptions::retained(QoS::AtLeastOnce),
        )
        .await
}
