//! Interfaces to the systems around the messaging core
//!
//! Storage, real-time fan-out to dashboards and the audit trail belong to other
//! parts of the application. The core only sees them through these traits;
//! `crate::testing` has in-memory implementations.

use crate::gateway::{Gateway, GatewayStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Device record as stored by the persistence layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub site_id: String,
    pub name: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    /// Gateway bridging this device
    #[serde(default)]
    pub gateway_id: Option<String>,
    /// Address of the device behind a multiplexing gateway
    #[serde(default)]
    pub device_path: Option<String>,
}

/// Partial device update; `None` leaves a field unchanged
///
/// The nested options on the gateway link distinguish "unchanged" from "clear".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DevicePatch {
    pub status: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub gateway_id: Option<Option<String>>,
    pub device_path: Option<Option<String>>,
}

impl DevicePatch {
    /// Apply the patch to a record
    pub fn apply(&self, device: &mut DeviceRecord) {
        if let Some(status) = &self.status {
            device.status = Some(status.clone());
        }
        if let Some(last_seen) = self.last_seen {
            device.last_seen = Some(last_seen);
        }
        if let Some(gateway_id) = &self.gateway_id {
            device.gateway_id = gateway_id.clone();
        }
        if let Some(device_path) = &self.device_path {
            device.device_path = device_path.clone();
        }
    }
}

/// One validated telemetry sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceReading {
    pub device_id: String,
    pub site_id: String,
    pub timestamp: DateTime<Utc>,
    pub power: f64,
    pub energy: Option<f64>,
    pub state_of_charge: Option<f64>,
    pub voltage: Option<f64>,
    pub temperature: Option<f64>,
    pub additional_data: Option<Value>,
}

/// One site-level energy flow sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnergyReading {
    pub site_id: String,
    pub timestamp: DateTime<Utc>,
    pub production: Option<f64>,
    pub consumption: Option<f64>,
    pub grid_import: Option<f64>,
    pub grid_export: Option<f64>,
    pub battery_power: Option<f64>,
}

/// Audit trail entry for administrative changes
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub action: String,
    pub gateway_id: String,
    pub device_id: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: &str, gateway_id: &str) -> Self {
        Self {
            action: action.to_string(),
            gateway_id: gateway_id.to_string(),
            device_id: None,
            detail: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_device(mut self, device_id: &str) -> Self {
        self.device_id = Some(device_id.to_string());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Failures reported by collaborators
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PersistenceError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("Storage failure: {0}")]
    Storage(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
#[error("Broadcast failed: {0}")]
pub struct BroadcastError(pub String);

/// Device, reading and gateway storage
#[async_trait]
pub trait DevicePersistence: Send + Sync {
    async fn get_device(&self, id: &str) -> Result<Option<DeviceRecord>, PersistenceError>;

    async fn update_device(
        &self,
        id: &str,
        patch: DevicePatch,
    ) -> Result<DeviceRecord, PersistenceError>;

    async fn create_reading(&self, reading: DeviceReading) -> Result<(), PersistenceError>;

    async fn create_energy_reading(&self, reading: EnergyReading) -> Result<(), PersistenceError>;

    async fn get_gateway(&self, id: &str) -> Result<Option<Gateway>, PersistenceError>;

    async fn save_gateway(&self, gateway: &Gateway) -> Result<(), PersistenceError>;

    async fn update_gateway_status(
        &self,
        id: &str,
        status: GatewayStatus,
        error: Option<String>,
    ) -> Result<(), PersistenceError>;
}

/// Real-time fan-out of finished readings to dashboard clients
#[async_trait]
pub trait ReadingBroadcaster: Send + Sync {
    async fn broadcast_device_reading(
        &self,
        device_id: &str,
        reading: &DeviceReading,
    ) -> Result<(), BroadcastError>;

    async fn broadcast_energy_reading(
        &self,
        site_id: &str,
        reading: &EnergyReading,
    ) -> Result<(), BroadcastError>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<(), PersistenceError>;
}
