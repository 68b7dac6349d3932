//! Telemetry and site energy handlers

use super::HandlerContext;
use crate::collaborators::{DevicePatch, DeviceReading, EnergyReading};
use crate::protocol::{EnergyPayload, TelemetryPayload, WireTimestamp};
use crate::routing::{HandlerError, InboundMessage, MessageHandler};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// Device status written when telemetry arrives
pub const ONLINE_STATUS: &str = "online";

fn reading_time(timestamp: Option<WireTimestamp>) -> DateTime<Utc> {
    timestamp
        .and_then(WireTimestamp::to_datetime)
        .unwrap_or_else(Utc::now)
}

fn check_finite(field: &str, value: Option<f64>) -> Result<(), String> {
    match value {
        Some(v) if !v.is_finite() => Err(format!("{field} must be a finite number")),
        _ => Ok(()),
    }
}

fn validate_telemetry(payload: &TelemetryPayload) -> Result<(), String> {
    check_finite("power", Some(payload.power))?;
    check_finite("energy", payload.energy)?;
    check_finite("voltage", payload.voltage)?;
    check_finite("temperature", payload.temperature)?;
    check_finite("stateOfCharge", payload.state_of_charge)?;
    if let Some(soc) = payload.state_of_charge {
        if !(0.0..=100.0).contains(&soc) {
            return Err(format!("stateOfCharge {soc} outside 0..=100"));
        }
    }
    Ok(())
}

/// Stores device telemetry from `{root}/:siteId/devices/:deviceId/telemetry`
///
/// A stored reading marks the device online and is broadcast to dashboards.
pub struct TelemetryHandler {
    context: HandlerContext,
}

impl TelemetryHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for TelemetryHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        let site_id = message.require_param("siteId")?;
        let device_id = message.require_param("deviceId")?;

        let payload: TelemetryPayload = message
            .payload
            .parse()
            .map_err(|e| self.context.reject(e))?;
        validate_telemetry(&payload).map_err(|e| self.context.reject(e))?;

        let device = self
            .context
            .persistence
            .get_device(device_id)
            .await?
            .ok_or_else(|| HandlerError::UnknownDevice(device_id.to_string()))?;
        if device.site_id != site_id {
            return Err(self.context.reject(format!(
                "device {} belongs to site {}, not {}",
                device_id, device.site_id, site_id
            )));
        }

        let reading = DeviceReading {
            device_id: device_id.to_string(),
            site_id: site_id.to_string(),
            timestamp: reading_time(payload.timestamp),
            power: payload.power,
            energy: payload.energy,
            state_of_charge: payload.state_of_charge,
            voltage: payload.voltage,
            temperature: payload.temperature,
            additional_data: payload.additional_data,
        };

        self.context
            .persistence
            .create_reading(reading.clone())
            .await?;
        if let Some(metrics) = &self.context.metrics {
            metrics.reading_stored();
        }
        debug!("Stored reading for device {} ({} W)", device_id, reading.power);

        let patch = DevicePatch {
            status: Some(ONLINE_STATUS.to_string()),
            last_seen: Some(reading.timestamp),
            ..Default::default()
        };
        if let Err(e) = self.context.persistence.update_device(device_id, patch).await {
            warn!("Failed to mark device {} online: {}", device_id, e);
        }

        if let Err(e) = self
            .context
            .broadcaster
            .broadcast_device_reading(device_id, &reading)
            .await
        {
            warn!("Reading for device {} not broadcast: {}", device_id, e);
            if let Some(metrics) = &self.context.metrics {
                metrics.broadcast_failed();
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "telemetry"
    }
}

/// Stores site energy flows from `{root}/:siteId/energy`
pub struct EnergyHandler {
    context: HandlerContext,
}

impl EnergyHandler {
    pub fn new(context: HandlerContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl MessageHandler for EnergyHandler {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        let site_id = message.require_param("siteId")?;
        let payload: EnergyPayload = message
            .payload
            .parse()
            .map_err(|e| self.context.reject(e))?;

        let flows = [
            ("production", payload.production),
            ("consumption", payload.consumption),
            ("gridImport", payload.grid_import),
            ("gridExport", payload.grid_export),
            ("batteryPower", payload.battery_power),
        ];
        if flows.iter().all(|(_, value)| value.is_none()) {
            return Err(self.context.reject("energy message carries no values".to_string()));
        }
        for (field, value) in flows {
            check_finite(field, value).map_err(|e| self.context.reject(e))?;
        }

        let reading = EnergyReading {
            site_id: site_id.to_string(),
            timestamp: reading_time(payload.timestamp),
            production: payload.production,
            consumption: payload.consumption,
            grid_import: payload.grid_import,
            grid_export: payload.grid_export,
            battery_power: payload.battery_power,
        };

        self.context
            .persistence
            .create_energy_reading(reading.clone())
            .await?;
        if let Some(metrics) = &self.context.metrics {
            metrics.reading_stored();
        }

        if let Err(e) = self
            .context
            .broadcaster
            .broadcast_energy_reading(site_id, &reading)
            .await
        {
            warn!("Energy reading for site {} not broadcast: {}", site_id, e);
            if let Some(metrics) = &self.context.metrics {
                metrics.broadcast_failed();
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "energy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::MetricsCollector;
    use crate::protocol::{extract, DecodedPayload, TopicBuilder};
    use crate::testing::{InMemoryPersistence, RecordingBroadcaster};
    use crate::transport::QoS;
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Fixture {
        persistence: Arc<InMemoryPersistence>,
        broadcaster: Arc<RecordingBroadcaster>,
        metrics: Arc<MetricsCollector>,
        context: HandlerContext,
    }

    fn fixture_with(broadcaster: RecordingBroadcaster) -> Fixture {
        let persistence = Arc::new(InMemoryPersistence::new());
        persistence.insert_device("9", "3", "Home battery");
        let broadcaster = Arc::new(broadcaster);
        let metrics = Arc::new(MetricsCollector::new());
        let context = HandlerContext::new(persistence.clone(), broadcaster.clone())
            .with_metrics(metrics.clone());
        Fixture {
            persistence,
            broadcaster,
            metrics,
            context,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(RecordingBroadcaster::new())
    }

    fn message(pattern: &str, topic: &str, payload: Value) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            payload: DecodedPayload::Json(payload),
            params: extract(pattern, topic).unwrap(),
            retained: false,
            qos: QoS::AtLeastOnce,
        }
    }

    fn telemetry(payload: Value) -> InboundMessage {
        let topics = TopicBuilder::new("ems");
        message(
            &topics.telemetry_pattern(),
            &topics.device_telemetry("3", "9"),
            payload,
        )
    }

    #[tokio::test]
    async fn test_telemetry_stored_and_broadcast() {
        let f = fixture();
        let handler = TelemetryHandler::new(f.context.clone());

        handler
            .handle(&telemetry(json!({
                "timestamp": "2024-05-01T12:00:00Z",
                "power": 1500,
                "energy": 12.5,
                "stateOfCharge": 80
            })))
            .await
            .unwrap();

        let readings = f.persistence.readings();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].power, 1500.0);
        assert_eq!(readings[0].state_of_charge, Some(80.0));
        assert_eq!(readings[0].timestamp.to_rfc3339(), "2024-05-01T12:00:00+00:00");

        let device = f.persistence.device("9").unwrap();
        assert_eq!(device.status.as_deref(), Some(ONLINE_STATUS));
        assert_eq!(device.last_seen, Some(readings[0].timestamp));

        let broadcasts = f.broadcaster.device_readings();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].0, "9");
        assert_eq!(f.metrics.get_metrics().devices.readings_stored, 1);
    }

    #[tokio::test]
    async fn test_epoch_millis_timestamp_accepted() {
        let f = fixture();
        let handler = TelemetryHandler::new(f.context.clone());

        handler
            .handle(&telemetry(json!({"timestamp": 1714564800000i64, "power": 10})))
            .await
            .unwrap();

        assert_eq!(
            f.persistence.readings()[0].timestamp.timestamp_millis(),
            1714564800000
        );
    }

    #[tokio::test]
    async fn test_missing_power_rejected_without_write() {
        let f = fixture();
        let handler = TelemetryHandler::new(f.context.clone());

        let result = handler.handle(&telemetry(json!({"energy": 3.2}))).await;

        assert!(matches!(result, Err(HandlerError::InvalidPayload(_))));
        assert_eq!(f.persistence.create_reading_calls(), 0);
        assert_eq!(f.metrics.get_metrics().devices.readings_rejected, 1);
    }

    #[tokio::test]
    async fn test_state_of_charge_out_of_range_rejected() {
        let f = fixture();
        let handler = TelemetryHandler::new(f.context.clone());

        let result = handler
            .handle(&telemetry(json!({"power": 5, "stateOfCharge": 140})))
            .await;

        assert!(matches!(result, Err(HandlerError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_raw_payload_rejected() {
        let f = fixture();
        let handler = TelemetryHandler::new(f.context.clone());
        let mut inbound = telemetry(json!({}));
        inbound.payload = DecodedPayload::decode(b"power=1500");

        let result = handler.handle(&inbound).await;
        assert!(matches!(result, Err(HandlerError::InvalidPayload(_))));
    }

    #[tokio::test]
    async fn test_unknown_device_and_site_mismatch() {
        let f = fixture();
        let handler = TelemetryHandler::new(f.context.clone());
        let topics = TopicBuilder::new("ems");

        let unknown = message(
            &topics.telemetry_pattern(),
            &topics.device_telemetry("3", "77"),
            json!({"power": 1}),
        );
        assert!(matches!(
            handler.handle(&unknown).await,
            Err(HandlerError::UnknownDevice(_))
        ));

        let wrong_site = message(
            &topics.telemetry_pattern(),
            &topics.device_telemetry("4", "9"),
            json!({"power": 1}),
        );
        assert!(matches!(
            handler.handle(&wrong_site).await,
            Err(HandlerError::InvalidPayload(_))
        ));
        assert_eq!(f.persistence.create_reading_calls(), 0);
    }

    #[tokio::test]
    async fn test_persistence_failure_skips_broadcast() {
        let f = fixture();
        f.persistence.set_fail_writes(true);
        let handler = TelemetryHandler::new(f.context.clone());

        let result = handler.handle(&telemetry(json!({"power": 1500}))).await;

        assert!(matches!(result, Err(HandlerError::Persistence(_))));
        assert!(f.broadcaster.device_readings().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_failure_keeps_reading() {
        let f = fixture_with(RecordingBroadcaster::with_failure());
        let handler = TelemetryHandler::new(f.context.clone());

        handler
            .handle(&telemetry(json!({"power": 1500})))
            .await
            .unwrap();

        assert_eq!(f.persistence.readings().len(), 1);
        assert_eq!(f.metrics.get_metrics().devices.broadcast_failures, 1);
    }

    #[tokio::test]
    async fn test_energy_stored_and_broadcast() {
        let f = fixture();
        let handler = EnergyHandler::new(f.context.clone());
        let topics = TopicBuilder::new("ems");

        handler
            .handle(&message(
                &topics.energy_pattern(),
                &topics.site_energy("3"),
                json!({"production": 4.2, "consumption": 1.1, "gridExport": 3.1}),
            ))
            .await
            .unwrap();

        let stored = f.persistence.energy_readings();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].site_id, "3");
        assert_eq!(stored[0].grid_export, Some(3.1));
        assert_eq!(f.broadcaster.energy_readings()[0].0, "3");
    }

    #[tokio::test]
    async fn test_empty_energy_message_rejected() {
        let f = fixture();
        let handler = EnergyHandler::new(f.context.clone());
        let topics = TopicBuilder::new("ems");

        let result = handler
            .handle(&message(
                &topics.energy_pattern(),
                &topics.site_energy("3"),
                json!({"timestamp": "2024-05-01T12:00:00Z"}),
            ))
            .await;

        assert!(matches!(result, Err(HandlerError::InvalidPayload(_))));
        assert!(f.persistence.energy_readings().is_empty());
    }
}
