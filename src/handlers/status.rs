//! Device status, service status and gateway heartbeat handlers

use super::HandlerContext;
use crate::collaborators::DevicePatch;
use crate::gateway::{GatewayError, GatewayManager};
use crate::protocol::{
    DecodedPayload, DeviceStatusPayload, GatewayHeartbeat, SystemStatus, SystemStatusType,
    WireTimestamp,
};
use crate::routing::{HandlerError, InboundMessage, MessageHandler};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Updates device status from `{root}/:siteId/devices/:deviceId/status`
///
/// Accepts a JSON envelope or a bare status string.
pub struct DeviceStatusHandler {
    context: HandlerContext,
}

impl DeviceStatusHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }

    fn read_status(payload: &DecodedPayload) -> Result<DeviceStatusPayload, String> {
        match payload {
            DecodedPayload::Json(serde_json::Value::String(status)) => Ok(DeviceStatusPayload {
                status: status.clone(),
                timestamp: None,
                message: None,
            }),
            DecodedPayload::Json(_) => payload.parse(),
            DecodedPayload::Raw(_) => payload
                .as_text()
                .map(|text| DeviceStatusPayload {
                    status: text.trim().to_string(),
                    timestamp: None,
                    message: None,
                })
                .ok_or_else(|| "status payload is not text".to_string()),
        }
    }
}

#[async_trait]
impl MessageHandler for DeviceStatusHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        let site_id = message.require_param("siteId")?;
        let device_id = message.require_param("deviceId")?;

        let payload = Self::read_status(&message.payload).map_err(HandlerError::InvalidPayload)?;
        let status = payload.status.trim().to_lowercase();
        if status.is_empty() {
            return Err(HandlerError::InvalidPayload("empty device status".to_string()));
        }

        let device = self
            .context
            .persistence
            .get_device(device_id)
            .await?
            .ok_or_else(|| HandlerError::UnknownDevice(device_id.to_string()))?;
        if device.site_id != site_id {
            return Err(HandlerError::InvalidPayload(format!(
                "device {} belongs to site {}, not {}",
                device_id, device.site_id, site_id
            )));
        }

        let seen_at = payload
            .timestamp
            .and_then(WireTimestamp::to_datetime)
            .unwrap_or_else(Utc::now);
        self.context
            .persistence
            .update_device(
                device_id,
                DevicePatch {
                    status: Some(status.clone()),
                    last_seen: Some(seen_at),
                    ..Default::default()
                },
            )
            .await?;

        match payload.message {
            Some(detail) => info!("Device {} reports {}: {}", device_id, status, detail),
            None => debug!("Device {} reports {}", device_id, status),
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "device-status"
    }
}

/// Tracks service status announcements on `{root}/system/status`
#[derive(Default)]
pub struct SystemStatusHandler {
    services: RwLock<HashMap<String, SystemStatus>>,
}

impl SystemStatusHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last status announced by `service_id`
    pub fn service_status(&self, service_id: &str) -> Option<SystemStatusType> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service_id)
            .map(|status| status.status)
    }

    /// Services that announced themselves online, sorted
    pub fn online_services(&self) -> Vec<String> {
        let mut online: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|status| status.status == SystemStatusType::Online)
            .map(|status| status.service_id.clone())
            .collect();
        online.sort();
        online
    }
}

#[async_trait]
impl MessageHandler for SystemStatusHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        let status: SystemStatus = message
            .payload
            .parse()
            .map_err(HandlerError::InvalidPayload)?;

        let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
        let previous = services.get(&status.service_id).map(|s| s.status);
        if let Some(known) = services.get(&status.service_id) {
            if known.timestamp > status.timestamp {
                debug!("Ignoring stale status from {}", status.service_id);
                return Ok(());
            }
        }

        if previous != Some(status.status) {
            info!(
                "Service {} is {:?}{}",
                status.service_id,
                status.status,
                if message.retained { " (retained)" } else { "" }
            );
        }
        services.insert(status.service_id.clone(), status);
        Ok(())
    }

    fn name(&self) -> &str {
        "system-status"
    }
}

/// Records gateway heartbeats from `{root}/gateways/:gatewayId/heartbeat`
///
/// Liveness is judged by receive time; the gateway's own clock is only logged.
pub struct GatewayHeartbeatHandler {
    gateways: Arc<GatewayManager>,
}

impl GatewayHeartbeatHandler {
    pub fn new(gateways: Arc<GatewayManager>) -> Self {
        Self { gateways }
    }
}

#[async_trait]
impl MessageHandler for GatewayHeartbeatHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        let gateway_id = message.require_param("gatewayId")?;

        if message.retained {
            debug!("Ignoring retained heartbeat for gateway {}", gateway_id);
            return Ok(());
        }

        let heartbeat = message.payload.parse::<GatewayHeartbeat>().ok();
        if let Some(uptime) = heartbeat.as_ref().and_then(|h| h.uptime_secs) {
            debug!("Gateway {} uptime {}s", gateway_id, uptime);
        }

        match self.gateways.record_heartbeat(gateway_id, Utc::now()).await {
            Ok(_) => Ok(()),
            Err(GatewayError::NotFound(id)) => Err(HandlerError::UnknownGateway(id)),
            Err(GatewayError::Persistence(e)) => Err(e.into()),
            Err(e) => {
                warn!("Heartbeat from gateway {} not recorded: {}", gateway_id, e);
                Err(HandlerError::Other(e.to_string()))
            }
        }
    }

    fn name(&self) -> &str {
        "gateway-heartbeat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaysSection;
    use crate::gateway::{GatewayEndpoint, GatewayProtocol, GatewayStatus, NewGateway};
    use crate::protocol::{extract, TopicBuilder};
    use crate::testing::{InMemoryPersistence, MemoryAuditLog, RecordingBroadcaster};
    use crate::transport::QoS;
    use serde_json::json;

    fn inbound(pattern: &str, topic: &str, payload: DecodedPayload, retained: bool) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload,
            params: extract(pattern, topic).unwrap(),
            retained,
            qos: QoS::AtLeastOnce,
        }
    }

    fn status_context() -> (Arc<InMemoryPersistence>, HandlerContext) {
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence.insert_device("9", "3", "Inverter");
        let context = HandlerContext::new(persistence.clone(), Arc::new(RecordingBroadcaster::new()));
        (persistence, context)
    }

    #[tokio::test]
    async fn test_json_device_status() {
        let (persistence, context) = status_context();
        let handler = DeviceStatusHandler::new(context);
        let topics = TopicBuilder::new("ems");

        handler
            .handle(&inbound(
                &topics.status_pattern(),
                &topics.device_status("3", "9"),
                DecodedPayload::Json(json!({"status": "Fault", "message": "overtemperature"})),
                false,
            ))
            .await
            .unwrap();

        let device = persistence.device("9").unwrap();
        assert_eq!(device.status.as_deref(), Some("fault"));
        assert!(device.last_seen.is_some());
    }

    #[tokio::test]
    async fn test_raw_text_device_status() {
        let (persistence, context) = status_context();
        let handler = DeviceStatusHandler::new(context);
        let topics = TopicBuilder::new("ems");

        handler
            .handle(&inbound(
                &topics.status_pattern(),
                &topics.device_status("3", "9"),
                DecodedPayload::decode(b"standby\n"),
                false,
            ))
            .await
            .unwrap();

        assert_eq!(persistence.device("9").unwrap().status.as_deref(), Some("standby"));
    }

    #[tokio::test]
    async fn test_status_for_unknown_device() {
        let (_, context) = status_context();
        let handler = DeviceStatusHandler::new(context);
        let topics = TopicBuilder::new("ems");

        let result = handler
            .handle(&inbound(
                &topics.status_pattern(),
                &topics.device_status("3", "404"),
                DecodedPayload::Json(json!("online")),
                false,
            ))
            .await;

        assert!(matches!(result, Err(HandlerError::UnknownDevice(_))));
    }

    #[tokio::test]
    async fn test_system_status_tracking() {
        let handler = SystemStatusHandler::new();
        let topic = TopicBuilder::new("ems").system_status();
        let now = Utc::now();

        for (service, status, at) in [
            ("ems-a", "online", now),
            ("ems-b", "online", now),
            ("ems-b", "offline", now + chrono::Duration::seconds(5)),
            ("ems-b", "online", now - chrono::Duration::seconds(5)),
        ] {
            let payload = json!({"serviceId": service, "status": status, "timestamp": at});
            handler
                .handle(&inbound(&topic, &topic, DecodedPayload::Json(payload), false))
                .await
                .unwrap();
        }

        assert_eq!(handler.online_services(), vec!["ems-a".to_string()]);
        assert_eq!(handler.service_status("ems-b"), Some(SystemStatusType::Offline));
        assert_eq!(handler.service_status("ems-c"), None);
    }

    async fn heartbeat_fixture() -> Arc<GatewayManager> {
        let manager = GatewayManager::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(MemoryAuditLog::new()),
            TopicBuilder::new("ems"),
            &GatewaysSection::default(),
            None,
        );
        manager
            .register_gateway(NewGateway {
                id: "gw-1".to_string(),
                name: "Roof gateway".to_string(),
                site_id: "3".to_string(),
                protocol: GatewayProtocol::MessageBroker,
                endpoint: GatewayEndpoint::new("10.0.0.5", 1883),
                heartbeat_interval_secs: 60,
            })
            .await
            .unwrap();
        Arc::new(manager)
    }

    #[tokio::test]
    async fn test_heartbeat_marks_gateway_connected() {
        let gateways = heartbeat_fixture().await;
        let handler = GatewayHeartbeatHandler::new(gateways.clone());
        let topics = TopicBuilder::new("ems");

        handler
            .handle(&inbound(
                &topics.gateway_heartbeat_pattern(),
                &topics.gateway_heartbeat("gw-1"),
                DecodedPayload::Json(json!({"uptimeSecs": 3600})),
                false,
            ))
            .await
            .unwrap();

        let gateway = gateways.get_gateway("gw-1").await.unwrap();
        assert_eq!(gateway.status, GatewayStatus::Connected);
        assert!(gateway.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn test_retained_heartbeat_ignored() {
        let gateways = heartbeat_fixture().await;
        let handler = GatewayHeartbeatHandler::new(gateways.clone());
        let topics = TopicBuilder::new("ems");

        handler
            .handle(&inbound(
                &topics.gateway_heartbeat_pattern(),
                &topics.gateway_heartbeat("gw-1"),
                DecodedPayload::decode(b""),
                true,
            ))
            .await
            .unwrap();

        assert!(!gateways.get_gateway("gw-1").await.unwrap().is_connected());
    }

    #[tokio::test]
    async fn test_heartbeat_from_unknown_gateway() {
        let gateways = heartbeat_fixture().await;
        let handler = GatewayHeartbeatHandler::new(gateways);
        let topics = TopicBuilder::new("ems");

        let result = handler
            .handle(&inbound(
                &topics.gateway_heartbeat_pattern(),
                &topics.gateway_heartbeat("gw-404"),
                DecodedPayload::Json(json!({})),
                false,
            ))
            .await;

        assert!(matches!(result, Err(HandlerError::UnknownGateway(_))));
    }
}
