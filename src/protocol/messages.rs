//! Wire envelopes exchanged with devices and gateways
//!
//! All structured payloads are JSON with camelCase field names. Payloads that do
//! not parse as JSON are carried through as raw bytes (see [`DecodedPayload`]).

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Inbound payload after decoding
///
/// Handlers must tolerate both shapes: a payload that fails structured decoding
/// is never dropped, it is passed through unchanged as [`DecodedPayload::Raw`].
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    Json(Value),
    Raw(Bytes),
}

impl DecodedPayload {
    /// Decode a payload, falling back to raw bytes
    pub fn decode(payload: &[u8]) -> Self {
        match serde_json::from_slice::<Value>(payload) {
            Ok(value) => DecodedPayload::Json(value),
            Err(_) => DecodedPayload::Raw(Bytes::copy_from_slice(payload)),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            DecodedPayload::Json(value) => Some(value),
            DecodedPayload::Raw(_) => None,
        }
    }

    /// Text view of the payload (raw payloads only when valid UTF-8)
    pub fn as_text(&self) -> Option<String> {
        match self {
            DecodedPayload::Json(Value::String(s)) => Some(s.clone()),
            DecodedPayload::Json(value) => Some(value.to_string()),
            DecodedPayload::Raw(bytes) => std::str::from_utf8(bytes).ok().map(str::to_string),
        }
    }

    /// Deserialize the JSON form into a typed envelope
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, String> {
        match self {
            DecodedPayload::Json(value) => {
                T::deserialize(value).map_err(|e| format!("Invalid payload: {e}"))
            }
            DecodedPayload::Raw(_) => Err("Payload is not JSON".to_string()),
        }
    }
}

/// Timestamp as sent by devices: RFC 3339 string or epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireTimestamp {
    Rfc3339(DateTime<Utc>),
    EpochMillis(i64),
}

impl WireTimestamp {
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        match self {
            WireTimestamp::Rfc3339(dt) => Some(dt),
            WireTimestamp::EpochMillis(ms) => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

/// Device telemetry published on `{root}/{siteId}/devices/{deviceId}/telemetry`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryPayload {
    /// Missing timestamps are stamped with the receive time
    pub timestamp: Option<WireTimestamp>,
    /// Instantaneous power in watts
    pub power: f64,
    /// Cumulative energy in kWh
    #[serde(default)]
    pub energy: Option<f64>,
    #[serde(default)]
    pub state_of_charge: Option<f64>,
    #[serde(default)]
    pub voltage: Option<f64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub additional_data: Option<Value>,
}

/// Device status published on `{root}/{siteId}/devices/{deviceId}/status`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatusPayload {
    pub status: String,
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Site-level energy flows published on `{root}/{siteId}/energy`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyPayload {
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default)]
    pub production: Option<f64>,
    #[serde(default)]
    pub consumption: Option<f64>,
    #[serde(default)]
    pub grid_import: Option<f64>,
    #[serde(default)]
    pub grid_export: Option<f64>,
    #[serde(default)]
    pub battery_power: Option<f64>,
}

/// Service-wide status on `{root}/system/status`, also used as the last will
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemStatus {
    pub service_id: String,
    pub status: SystemStatusType,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatusType {
    Online,
    Offline,
}

/// Liveness signal pushed by a gateway on `{root}/gateways/{gatewayId}/heartbeat`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayHeartbeat {
    #[serde(default)]
    pub timestamp: Option<WireTimestamp>,
    #[serde(default)]
    pub uptime_secs: Option<u64>,
}

/// Command envelope published on the target's command topic
///
/// # Examples
/// ```
/// use ems_messaging::protocol::CommandEnvelope;
/// use serde_json::json;
///
/// let envelope = CommandEnvelope::new("setChargeLimit", json!({"limit": 80}));
/// let wire = serde_json::to_value(&envelope).unwrap();
/// assert_eq!(wire["command"], "setChargeLimit");
/// assert!(wire.get("commandId").is_some());
/// assert!(wire.get("timestamp").is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    pub command_id: Uuid,
    pub command: String,
    pub parameters: Value,
    #[serde(rename = "timestamp")]
    pub issued_at: DateTime<Utc>,
}

impl CommandEnvelope {
    pub fn new(command: &str, parameters: Value) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            command: command.to_string(),
            parameters,
            issued_at: Utc::now(),
        }
    }
}

/// Device reply correlated to a command by `commandId`
///
/// Any fields beyond `commandId` and `success` are kept in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResponse {
    pub command_id: Uuid,
    pub success: bool,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl CommandResponse {
    /// Response payload without the correlation fields
    pub fn payload(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_json_payload() {
        let decoded = DecodedPayload::decode(br#"{"power": 1500}"#);
        assert_eq!(decoded.as_json().unwrap()["power"], 1500);
    }

    #[test]
    fn test_decode_falls_back_to_raw() {
        let decoded = DecodedPayload::decode(b"ON");
        assert_eq!(decoded, DecodedPayload::Raw(Bytes::from_static(b"ON")));
        assert_eq!(decoded.as_text(), Some("ON".to_string()));
        assert!(decoded.parse::<TelemetryPayload>().is_err());
    }

    #[test]
    fn test_decode_keeps_non_utf8_bytes() {
        let decoded = DecodedPayload::decode(&[0xff, 0x00, 0x10]);
        assert_eq!(
            decoded,
            DecodedPayload::Raw(Bytes::from_static(&[0xff, 0x00, 0x10]))
        );
        assert_eq!(decoded.as_text(), None);
    }

    #[test]
    fn test_telemetry_parses_camel_case() {
        let decoded = DecodedPayload::Json(json!({
            "timestamp": "2024-05-01T12:00:00Z",
            "power": 1500.0,
            "energy": 12.5,
            "stateOfCharge": 80.0,
            "additionalData": {"mode": "eco"}
        }));
        let telemetry: TelemetryPayload = decoded.parse().unwrap();
        assert_eq!(telemetry.power, 1500.0);
        assert_eq!(telemetry.state_of_charge, Some(80.0));
        assert_eq!(telemetry.voltage, None);
        assert_eq!(telemetry.additional_data, Some(json!({"mode": "eco"})));
        assert!(telemetry.timestamp.unwrap().to_datetime().is_some());
    }

    #[test]
    fn test_telemetry_requires_power() {
        let decoded = DecodedPayload::Json(json!({"energy": 1.0}));
        assert!(decoded.parse::<TelemetryPayload>().is_err());
    }

    #[test]
    fn test_epoch_millis_timestamp() {
        let ts: WireTimestamp = serde_json::from_value(json!(1_714_564_800_000i64)).unwrap();
        let dt = ts.to_datetime().unwrap();
        assert_eq!(dt.timestamp(), 1_714_564_800);
    }

    #[test]
    fn test_command_response_keeps_extra_fields() {
        let id = Uuid::new_v4();
        let response: CommandResponse = serde_json::from_value(json!({
            "commandId": id,
            "success": true,
            "appliedLimit": 80
        }))
        .unwrap();
        assert_eq!(response.command_id, id);
        assert!(response.success);
        assert_eq!(response.payload(), json!({"appliedLimit": 80}));
    }

    #[test]
    fn test_system_status_wire_shape() {
        let status = SystemStatus {
            service_id: "ems-core".to_string(),
            status: SystemStatusType::Offline,
            timestamp: Utc::now(),
        };
        let wire = serde_json::to_value(&status).unwrap();
        assert_eq!(wire["serviceId"], "ems-core");
        assert_eq!(wire["status"], "offline");
    }
}
