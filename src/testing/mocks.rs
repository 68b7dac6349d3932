//! Mock implementations for testing
//!
//! In-memory persistence, broadcaster and audit log so handlers and the
//! gateway manager can be exercised without a database or dashboard clients.

use crate::collaborators::{
    AuditEntry, AuditLog, BroadcastError, DevicePatch, DevicePersistence, DeviceReading,
    DeviceRecord, EnergyReading, PersistenceError, ReadingBroadcaster,
};
use crate::gateway::{Gateway, GatewayStatus};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Persistence backed by hash maps, with call counters
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    devices: Mutex<HashMap<String, DeviceRecord>>,
    readings: Mutex<Vec<DeviceReading>>,
    energy_readings: Mutex<Vec<EnergyReading>>,
    gateways: Mutex<HashMap<String, Gateway>>,
    gateway_statuses: Mutex<HashMap<String, (GatewayStatus, Option<String>)>>,
    create_reading_calls: AtomicUsize,
    update_device_calls: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a device record
    pub fn insert_device(&self, id: &str, site_id: &str, name: &str) {
        lock(&self.devices).insert(
            id.to_string(),
            DeviceRecord {
                id: id.to_string(),
                site_id: site_id.to_string(),
                name: name.to_string(),
                status: None,
                last_seen: None,
                gateway_id: None,
                device_path: None,
            },
        );
    }

    /// Make every write fail with a storage error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn device(&self, id: &str) -> Option<DeviceRecord> {
        lock(&self.devices).get(id).cloned()
    }

    pub fn readings(&self) -> Vec<DeviceReading> {
        lock(&self.readings).clone()
    }

    pub fn energy_readings(&self) -> Vec<EnergyReading> {
        lock(&self.energy_readings).clone()
    }

    /// Last status written through `update_gateway_status`
    pub fn gateway_status(&self, id: &str) -> Option<(GatewayStatus, Option<String>)> {
        lock(&self.gateway_statuses).get(id).cloned()
    }

    pub fn create_reading_calls(&self) -> usize {
        self.create_reading_calls.load(Ordering::SeqCst)
    }

    pub fn update_device_calls(&self) -> usize {
        self.update_device_calls.load(Ordering::SeqCst)
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Storage("simulated write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DevicePersistence for InMemoryPersistence {
    async fn get_device(&self, id: &str) -> Result<Option<DeviceRecord>, PersistenceError> {
        Ok(self.device(id))
    }

    async fn update_device(
        &self,
        id: &str,
        patch: DevicePatch,
    ) -> Result<DeviceRecord, PersistenceError> {
        self.update_device_calls.fetch_add(1, Ordering::SeqCst);
        self.check_writable()?;

        let mut devices = lock(&self.devices);
        let device = devices.get_mut(id).ok_or_else(|| PersistenceError::NotFound {
            kind: "device",
            id: id.to_string(),
        })?;
        patch.apply(device);
        Ok(device.clone())
    }

    async fn create_reading(&self, reading: DeviceReading) -> Result<(), PersistenceError> {
        self.create_reading_calls.fetch_add(1, Ordering::SeqCst);
        self.check_writable()?;
        lock(&self.readings).push(reading);
        Ok(())
    }

    async fn create_energy_reading(&self, reading: EnergyReading) -> Result<(), PersistenceError> {
        self.check_writable()?;
        lock(&self.energy_readings).push(reading);
        Ok(())
    }

    async fn get_gateway(&self, id: &str) -> Result<Option<Gateway>, PersistenceError> {
        Ok(lock(&self.gateways).get(id).cloned())
    }

    async fn save_gateway(&self, gateway: &Gateway) -> Result<(), PersistenceError> {
        self.check_writable()?;
        lock(&self.gateways).insert(gateway.id.clone(), gateway.clone());
        Ok(())
    }

    async fn update_gateway_status(
        &self,
        id: &str,
        status: GatewayStatus,
        error: Option<String>,
    ) -> Result<(), PersistenceError> {
        self.check_writable()?;
        if let Some(gateway) = lock(&self.gateways).get_mut(id) {
            gateway.status = status;
            gateway.status_reason = error.clone();
        }
        lock(&self.gateway_statuses).insert(id.to_string(), (status, error));
        Ok(())
    }
}

/// Broadcaster that records what it was asked to send
#[derive(Debug, Default)]
pub struct RecordingBroadcaster {
    device_readings: Mutex<Vec<(String, DeviceReading)>>,
    energy_readings: Mutex<Vec<(String, EnergyReading)>>,
    should_fail: bool,
}

impl RecordingBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure() -> Self {
        Self {
            should_fail: true,
            ..Default::default()
        }
    }

    pub fn device_readings(&self) -> Vec<(String, DeviceReading)> {
        lock(&self.device_readings).clone()
    }

    pub fn energy_readings(&self) -> Vec<(String, EnergyReading)> {
        lock(&self.energy_readings).clone()
    }
}

#[async_trait]
impl ReadingBroadcaster for RecordingBroadcaster {
    async fn broadcast_device_reading(
        &self,
        device_id: &str,
        reading: &DeviceReading,
    ) -> Result<(), BroadcastError> {
        if self.should_fail {
            return Err(BroadcastError("no dashboard clients reachable".to_string()));
        }
        lock(&self.device_readings).push((device_id.to_string(), reading.clone()));
        Ok(())
    }

    async fn broadcast_energy_reading(
        &self,
        site_id: &str,
        reading: &EnergyReading,
    ) -> Result<(), BroadcastError> {
        if self.should_fail {
            return Err(BroadcastError("no dashboard clients reachable".to_string()));
        }
        lock(&self.energy_readings).push((site_id.to_string(), reading.clone()));
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        lock(&self.entries).clone()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn record(&self, entry: AuditEntry) -> Result<(), PersistenceError> {
        lock(&self.entries).push(entry);
        Ok(())
    }
}
