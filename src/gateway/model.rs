//! Gateway records

use super::credentials::GatewayCredentials;
use crate::collaborators::DeviceRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a gateway talks to this service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GatewayProtocol {
    MessageBroker,
    Http,
    RawTcp,
}

impl GatewayProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayProtocol::MessageBroker => "message-broker",
            GatewayProtocol::Http => "http",
            GatewayProtocol::RawTcp => "raw-tcp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "message-broker" | "mqtt" => Some(GatewayProtocol::MessageBroker),
            "http" => Some(GatewayProtocol::Http),
            "raw-tcp" | "modbus" => Some(GatewayProtocol::RawTcp),
            _ => None,
        }
    }
}

impl fmt::Display for GatewayProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Connected,
    Disconnected,
    Error,
}

impl GatewayStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayStatus::Connected => "connected",
            GatewayStatus::Disconnected => "disconnected",
            GatewayStatus::Error => "error",
        }
    }
}

/// Network location of a gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub tls: bool,
    /// Request path for HTTP reachability probes
    #[serde(default)]
    pub path: Option<String>,
}

impl GatewayEndpoint {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            tls: false,
            path: None,
        }
    }

    pub fn with_tls(mut self) -> Self {
        self.tls = true;
        self
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Administrative request to add a gateway
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGateway {
    pub id: String,
    pub name: String,
    pub site_id: String,
    pub protocol: GatewayProtocol,
    pub endpoint: GatewayEndpoint,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_heartbeat_interval() -> u64 {
    60
}

/// A gateway and its connection health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Gateway {
    pub id: String,
    pub name: String,
    pub site_id: String,
    pub protocol: GatewayProtocol,
    pub endpoint: GatewayEndpoint,
    pub status: GatewayStatus,
    /// Why the gateway left the connected state
    #[serde(default)]
    pub status_reason: Option<String>,
    #[serde(default)]
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub heartbeat_interval_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<GatewayCredentials>,
}

impl Gateway {
    pub fn from_request(request: NewGateway) -> Self {
        Self {
            id: request.id,
            name: request.name,
            site_id: request.site_id,
            protocol: request.protocol,
            endpoint: request.endpoint,
            status: GatewayStatus::Disconnected,
            status_reason: None,
            last_heartbeat: None,
            heartbeat_interval_secs: request.heartbeat_interval_secs,
            credentials: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status == GatewayStatus::Connected
    }
}

/// A device bridged by a gateway
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectedDevice {
    pub device: DeviceRecord,
    pub gateway_id: String,
    pub device_path: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Gateways per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayStatusCounts {
    pub connected: usize,
    pub disconnected: usize,
    pub error: usize,
}

impl GatewayStatusCounts {
    pub fn total(&self) -> usize {
        self.connected + self.disconnected + self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_wire_names() {
        assert_eq!(
            serde_json::to_value(GatewayProtocol::MessageBroker).unwrap(),
            json!("message-broker")
        );
        assert_eq!(
            serde_json::to_value(GatewayProtocol::RawTcp).unwrap(),
            json!("raw-tcp")
        );
        assert_eq!(GatewayProtocol::parse("http"), Some(GatewayProtocol::Http));
        assert_eq!(GatewayProtocol::parse("modbus"), Some(GatewayProtocol::RawTcp));
        assert_eq!(GatewayProtocol::parse("zigbee"), None);
    }

    #[test]
    fn test_new_gateway_starts_disconnected() {
        let request: NewGateway = serde_json::from_value(json!({
            "id": "gw-1",
            "name": "Garage",
            "siteId": "3",
            "protocol": "http",
            "endpoint": {"host": "10.0.0.5", "port": 8080}
        }))
        .unwrap();
        let gateway = Gateway::from_request(request);

        assert_eq!(gateway.status, GatewayStatus::Disconnected);
        assert_eq!(gateway.heartbeat_interval_secs, 60);
        assert_eq!(gateway.endpoint.address(), "10.0.0.5:8080");
        assert!(!gateway.endpoint.tls);
        assert!(!gateway.is_connected());
    }
}
