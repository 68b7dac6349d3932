//! Gateway lifecycle manager
//!
//! Gateway records and device links live in one registry behind a std
//! `RwLock`. Every status change is applied inside a single write section, so
//! readers never see a half-updated gateway; persistence and audit calls run
//! after the lock is released.

use super::credentials::{generate_credentials, GatewayCredentials};
use super::model::{
    ConnectedDevice, Gateway, GatewayProtocol, GatewayStatus, GatewayStatusCounts, NewGateway,
};
use super::probe::{BrokerProbe, ConnectionProbe, ConnectionTestOutcome, HttpProbe, TcpProbe};
use super::GatewayError;
use crate::collaborators::{AuditEntry, AuditLog, DevicePatch, DevicePersistence};
use crate::config::GatewaysSection;
use crate::gateway_span;
use crate::observability::MetricsCollector;
use crate::protocol::{validate_segment_id, TopicBuilder};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

/// Status reason recorded when a gateway misses its heartbeats
pub const HEARTBEAT_TIMEOUT_REASON: &str = "heartbeat timeout";

/// Longest heartbeat interval a gateway may be registered with (one day)
pub const MAX_HEARTBEAT_INTERVAL_SECS: u64 = 86_400;

#[derive(Default)]
struct Registry {
    gateways: HashMap<String, Gateway>,
    /// gateway id -> device id -> link
    links: HashMap<String, BTreeMap<String, ConnectedDevice>>,
}

/// Whether a connected gateway's last heartbeat is older than its interval plus `grace`
pub fn heartbeat_overdue(gateway: &Gateway, now: DateTime<Utc>, grace: Duration) -> bool {
    let Some(last) = gateway.last_heartbeat else {
        return true;
    };
    // An interval too large to represent never expires
    let Some(interval) = i64::try_from(gateway.heartbeat_interval_secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
    else {
        return false;
    };
    let grace = chrono::Duration::from_std(grace).unwrap_or_else(|_| chrono::Duration::zero());
    match interval.checked_add(&grace) {
        Some(allowed) => now.signed_duration_since(last) > allowed,
        None => false,
    }
}

/// Owns gateway records, liveness and device links
pub struct GatewayManager {
    registry: RwLock<Registry>,
    persistence: Arc<dyn DevicePersistence>,
    audit: Arc<dyn AuditLog>,
    probes: HashMap<GatewayProtocol, Arc<dyn ConnectionProbe>>,
    topics: TopicBuilder,
    check_interval: Duration,
    grace_period: Duration,
    metrics: Option<Arc<MetricsCollector>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayManager {
    /// Create a manager with the standard probe for each protocol
    pub fn new(
        persistence: Arc<dyn DevicePersistence>,
        audit: Arc<dyn AuditLog>,
        topics: TopicBuilder,
        settings: &GatewaysSection,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        let probe_timeout = settings.probe_timeout();
        let probes: [Arc<dyn ConnectionProbe>; 3] = [
            Arc::new(BrokerProbe::new(probe_timeout, settings.simulate_broker_probe)),
            Arc::new(HttpProbe::new(probe_timeout)),
            Arc::new(TcpProbe::new(probe_timeout)),
        ];

        Self {
            registry: RwLock::new(Registry::default()),
            persistence,
            audit,
            probes: probes
                .into_iter()
                .map(|probe| (probe.protocol(), probe))
                .collect(),
            topics,
            check_interval: settings.heartbeat_check_interval(),
            grace_period: settings.grace_period(),
            metrics,
            monitor: Mutex::new(None),
        }
    }

    /// Replace the probe used for `probe.protocol()`
    pub fn with_probe(mut self, probe: Arc<dyn ConnectionProbe>) -> Self {
        self.probes.insert(probe.protocol(), probe);
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.registry.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn audit(&self, entry: AuditEntry) {
        let action = entry.action.clone();
        if let Err(e) = self.audit.record(entry).await {
            warn!("Failed to write audit entry {}: {}", action, e);
        }
    }

    async fn persist_status(&self, gateway_id: &str, status: GatewayStatus, reason: Option<String>) {
        if let Err(e) = self
            .persistence
            .update_gateway_status(gateway_id, status, reason)
            .await
        {
            warn!(
                "Failed to persist status {} for gateway {}: {}",
                status.as_str(),
                gateway_id,
                e
            );
        }
    }

    /// Apply a status change atomically; returns the previous status
    fn transition(
        &self,
        gateway_id: &str,
        status: GatewayStatus,
        reason: Option<String>,
        heartbeat: Option<DateTime<Utc>>,
    ) -> Result<GatewayStatus, GatewayError> {
        let mut registry = self.write();
        let gateway = registry
            .gateways
            .get_mut(gateway_id)
            .ok_or_else(|| GatewayError::NotFound(gateway_id.to_string()))?;

        let previous = gateway.status;
        gateway.status = status;
        gateway.status_reason = reason;
        if let Some(at) = heartbeat {
            if gateway.last_heartbeat.map_or(true, |last| at > last) {
                gateway.last_heartbeat = Some(at);
            }
        }
        Ok(previous)
    }

    /// Add a gateway; it starts disconnected
    pub async fn register_gateway(&self, request: NewGateway) -> Result<Gateway, GatewayError> {
        validate_segment_id(&request.id)?;
        if !(1..=MAX_HEARTBEAT_INTERVAL_SECS).contains(&request.heartbeat_interval_secs) {
            return Err(GatewayError::InvalidHeartbeatInterval(
                request.heartbeat_interval_secs,
            ));
        }
        let gateway = Gateway::from_request(request);

        {
            let mut registry = self.write();
            if registry.gateways.contains_key(&gateway.id) {
                return Err(GatewayError::AlreadyExists(gateway.id));
            }
            registry.gateways.insert(gateway.id.clone(), gateway.clone());
        }

        if let Err(e) = self.persistence.save_gateway(&gateway).await {
            self.write().gateways.remove(&gateway.id);
            return Err(e.into());
        }

        info!(
            "Registered {} gateway {} for site {}",
            gateway.protocol, gateway.id, gateway.site_id
        );
        self.audit(
            AuditEntry::new("gateway.registered", &gateway.id)
                .with_detail(gateway.protocol.as_str()),
        )
        .await;
        Ok(gateway)
    }

    /// Gateway by id, loading it from persistence on first use
    pub async fn get_gateway(&self, gateway_id: &str) -> Result<Gateway, GatewayError> {
        if let Some(gateway) = self.read().gateways.get(gateway_id) {
            return Ok(gateway.clone());
        }

        let stored = self
            .persistence
            .get_gateway(gateway_id)
            .await?
            .ok_or_else(|| GatewayError::NotFound(gateway_id.to_string()))?;

        debug!("Loaded gateway {} from persistence", gateway_id);
        let mut registry = self.write();
        Ok(registry
            .gateways
            .entry(gateway_id.to_string())
            .or_insert(stored)
            .clone())
    }

    /// All known gateways, sorted by id
    pub fn list_gateways(&self) -> Vec<Gateway> {
        let mut gateways: Vec<Gateway> = self.read().gateways.values().cloned().collect();
        gateways.sort_by(|a, b| a.id.cmp(&b.id));
        gateways
    }

    /// Remove a gateway; refused while devices are linked to it
    pub async fn remove_gateway(&self, gateway_id: &str) -> Result<Gateway, GatewayError> {
        let removed = {
            let mut registry = self.write();
            let linked = registry.links.get(gateway_id).map_or(0, BTreeMap::len);
            if linked > 0 {
                return Err(GatewayError::DevicesLinked {
                    gateway_id: gateway_id.to_string(),
                    count: linked,
                });
            }
            registry.links.remove(gateway_id);
            registry
                .gateways
                .remove(gateway_id)
                .ok_or_else(|| GatewayError::NotFound(gateway_id.to_string()))?
        };

        info!("Removed gateway {}", gateway_id);
        self.audit(AuditEntry::new("gateway.removed", gateway_id)).await;
        Ok(removed)
    }

    /// Record a heartbeat; an offline gateway comes back online
    pub async fn record_heartbeat(
        &self,
        gateway_id: &str,
        at: DateTime<Utc>,
    ) -> Result<GatewayStatus, GatewayError> {
        self.get_gateway(gateway_id).await?;
        let previous = self.transition(gateway_id, GatewayStatus::Connected, None, Some(at))?;

        if let Some(metrics) = &self.metrics {
            metrics.heartbeat_received();
        }
        if previous != GatewayStatus::Connected {
            info!("Gateway {} is online (was {})", gateway_id, previous.as_str());
            self.persist_status(gateway_id, GatewayStatus::Connected, None)
                .await;
        } else {
            debug!("Heartbeat from gateway {}", gateway_id);
        }
        Ok(previous)
    }

    /// Put a gateway into the error state
    pub async fn mark_error(&self, gateway_id: &str, reason: &str) -> Result<(), GatewayError> {
        self.get_gateway(gateway_id).await?;
        self.transition(gateway_id, GatewayStatus::Error, Some(reason.to_string()), None)?;
        warn!("Gateway {} marked as error: {}", gateway_id, reason);
        self.persist_status(gateway_id, GatewayStatus::Error, Some(reason.to_string()))
            .await;
        Ok(())
    }

    /// Probe a gateway with the probe for its protocol and apply the result
    pub async fn test_connection(
        &self,
        gateway_id: &str,
    ) -> Result<ConnectionTestOutcome, GatewayError> {
        let gateway = self.get_gateway(gateway_id).await?;
        let probe = self
            .probes
            .get(&gateway.protocol)
            .cloned()
            .ok_or(GatewayError::NoProbe(gateway.protocol))?;

        let span = gateway_span!(gateway_id = %gateway.id, protocol = %gateway.protocol);
        let outcome = probe.test(&gateway).instrument(span).await;

        if let Some(metrics) = &self.metrics {
            metrics.connection_tested(outcome.success);
        }

        if outcome.success {
            self.transition(gateway_id, GatewayStatus::Connected, None, Some(Utc::now()))?;
            info!("Connection test for gateway {}: {}", gateway_id, outcome.summary());
            self.persist_status(gateway_id, GatewayStatus::Connected, None)
                .await;
        } else {
            let reason = outcome.summary();
            self.transition(gateway_id, GatewayStatus::Error, Some(reason.clone()), None)?;
            warn!("Connection test for gateway {} failed: {}", gateway_id, reason);
            self.persist_status(gateway_id, GatewayStatus::Error, Some(reason))
                .await;
        }

        Ok(outcome)
    }

    /// Take every connected gateway with an overdue heartbeat offline
    ///
    /// Returns the ids that timed out, sorted.
    pub async fn check_heartbeats(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut timed_out: Vec<String> = {
            let mut registry = self.write();
            registry
                .gateways
                .values_mut()
                .filter(|gateway| gateway.is_connected())
                .filter(|gateway| heartbeat_overdue(gateway, now, self.grace_period))
                .map(|gateway| {
                    gateway.status = GatewayStatus::Disconnected;
                    gateway.status_reason = Some(HEARTBEAT_TIMEOUT_REASON.to_string());
                    gateway.id.clone()
                })
                .collect()
        };
        timed_out.sort();

        for gateway_id in &timed_out {
            warn!("Gateway {} is offline: {}", gateway_id, HEARTBEAT_TIMEOUT_REASON);
            if let Some(metrics) = &self.metrics {
                metrics.gateway_timed_out();
            }
            self.persist_status(
                gateway_id,
                GatewayStatus::Disconnected,
                Some(HEARTBEAT_TIMEOUT_REASON.to_string()),
            )
            .await;
        }

        timed_out
    }

    /// Run [`Self::check_heartbeats`] on the configured interval
    ///
    /// Calling this again while the monitor runs has no effect.
    pub fn start_heartbeat_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if monitor.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let interval = self.check_interval;
        let manager = Arc::downgrade(self);
        *monitor = Some(tokio::spawn(Self::monitor_loop(manager, interval)));
        info!(
            interval_secs = interval.as_secs(),
            grace_secs = self.grace_period.as_secs(),
            "Gateway heartbeat monitor started"
        );
    }

    async fn monitor_loop(manager: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(manager) = manager.upgrade() else {
                break;
            };
            let timed_out = manager
                .check_heartbeats(Utc::now())
                .instrument(gateway_span!(check = "heartbeat"))
                .await;
            if !timed_out.is_empty() {
                debug!("Heartbeat check took {} gateway(s) offline", timed_out.len());
            }
        }
    }

    pub fn stop_heartbeat_monitor(&self) {
        if let Some(handle) = self.monitor.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    /// Link a device to a gateway, moving it off any previous gateway
    pub async fn connect_device(
        &self,
        gateway_id: &str,
        device_id: &str,
        device_path: Option<String>,
    ) -> Result<ConnectedDevice, GatewayError> {
        self.get_gateway(gateway_id).await?;
        self.persistence
            .get_device(device_id)
            .await?
            .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_string()))?;

        let device = self
            .persistence
            .update_device(
                device_id,
                DevicePatch {
                    gateway_id: Some(Some(gateway_id.to_string())),
                    device_path: Some(device_path.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let link = ConnectedDevice {
            device,
            gateway_id: gateway_id.to_string(),
            device_path: device_path.clone(),
            connected_at: Utc::now(),
        };

        {
            let mut registry = self.write();
            for links in registry.links.values_mut() {
                links.remove(device_id);
            }
            registry
                .links
                .entry(gateway_id.to_string())
                .or_default()
                .insert(device_id.to_string(), link.clone());
        }

        info!("Connected device {} to gateway {}", device_id, gateway_id);
        let mut entry = AuditEntry::new("device.connected", gateway_id).with_device(device_id);
        if let Some(path) = device_path {
            entry = entry.with_detail(format!("path {path}"));
        }
        self.audit(entry).await;
        Ok(link)
    }

    /// Unlink a device; false when it was not linked to this gateway
    pub async fn disconnect_device(
        &self,
        gateway_id: &str,
        device_id: &str,
    ) -> Result<bool, GatewayError> {
        let removed = self
            .write()
            .links
            .get_mut(gateway_id)
            .and_then(|links| links.remove(device_id))
            .is_some();
        if !removed {
            return Ok(false);
        }

        self.persistence
            .update_device(
                device_id,
                DevicePatch {
                    gateway_id: Some(None),
                    device_path: Some(None),
                    ..Default::default()
                },
            )
            .await?;

        info!("Disconnected device {} from gateway {}", device_id, gateway_id);
        self.audit(AuditEntry::new("device.disconnected", gateway_id).with_device(device_id))
            .await;
        Ok(true)
    }

    /// Devices linked to a gateway, ordered by device id
    pub fn connected_devices(&self, gateway_id: &str) -> Vec<ConnectedDevice> {
        self.read()
            .links
            .get(gateway_id)
            .map(|links| links.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Generate and store fresh credentials for a gateway
    ///
    /// The returned secrets are the only copy handed out; previous
    /// credentials stop being valid.
    pub async fn issue_credentials(
        &self,
        gateway_id: &str,
    ) -> Result<GatewayCredentials, GatewayError> {
        let gateway = self.get_gateway(gateway_id).await?;
        let credentials = generate_credentials(gateway.protocol, gateway_id, &self.topics);

        let updated = {
            let mut registry = self.write();
            let gateway = registry
                .gateways
                .get_mut(gateway_id)
                .ok_or_else(|| GatewayError::NotFound(gateway_id.to_string()))?;
            gateway.credentials = Some(credentials.clone());
            gateway.clone()
        };
        self.persistence.save_gateway(&updated).await?;

        info!("Issued {} credentials for gateway {}", gateway.protocol, gateway_id);
        self.audit(AuditEntry::new("credentials.issued", gateway_id)).await;
        Ok(credentials)
    }

    pub fn status_counts(&self) -> GatewayStatusCounts {
        self.read()
            .gateways
            .values()
            .fold(GatewayStatusCounts::default(), |mut counts, gateway| {
                match gateway.status {
                    GatewayStatus::Connected => counts.connected += 1,
                    GatewayStatus::Disconnected => counts.disconnected += 1,
                    GatewayStatus::Error => counts.error += 1,
                }
                counts
            })
    }
}

impl Drop for GatewayManager {
    fn drop(&mut self) {
        self.stop_heartbeat_monitor();
    }
}
