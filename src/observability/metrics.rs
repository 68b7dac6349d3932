//! Thread-safe metrics collection
//!
//! Atomic counters for the hot paths (messages, commands, readings) plus a
//! mutex-protected window of command round-trip times. A single collector is
//! created at startup and shared as `Arc<MetricsCollector>`.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Round-trip samples kept for percentile calculation
const MAX_ROUND_TRIP_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Broker connection
    broker_connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_received: AtomicU64,
    connection_start_time: AtomicU64,

    // Routing
    messages_dispatched: AtomicU64,
    unmatched_messages: AtomicU64,
    handler_failures: AtomicU64,
    handler_panics: AtomicU64,
    raw_payloads: AtomicU64,
    events_lagged: AtomicU64,

    // Commands
    commands_sent: AtomicU64,
    commands_completed: AtomicU64,
    commands_timed_out: AtomicU64,
    commands_publish_failed: AtomicU64,
    commands_cancelled: AtomicU64,
    late_responses: AtomicU64,
    round_trip_times: Mutex<Vec<u64>>,

    // Device data
    readings_stored: AtomicU64,
    readings_rejected: AtomicU64,
    broadcast_failures: AtomicU64,

    // Gateways
    heartbeats_received: AtomicU64,
    gateways_timed_out: AtomicU64,
    connection_tests: AtomicU64,
    connection_test_failures: AtomicU64,

    // Lifecycle
    service_state: Mutex<String>,
    uptime_start: AtomicU64,
    healthy: AtomicBool,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            broker_connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            messages_dispatched: AtomicU64::new(0),
            unmatched_messages: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            handler_panics: AtomicU64::new(0),
            raw_payloads: AtomicU64::new(0),
            events_lagged: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            commands_completed: AtomicU64::new(0),
            commands_timed_out: AtomicU64::new(0),
            commands_publish_failed: AtomicU64::new(0),
            commands_cancelled: AtomicU64::new(0),
            late_responses: AtomicU64::new(0),
            round_trip_times: Mutex::new(Vec::new()),
            readings_stored: AtomicU64::new(0),
            readings_rejected: AtomicU64::new(0),
            broadcast_failures: AtomicU64::new(0),
            heartbeats_received: AtomicU64::new(0),
            gateways_timed_out: AtomicU64::new(0),
            connection_tests: AtomicU64::new(0),
            connection_test_failures: AtomicU64::new(0),
            service_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            healthy: AtomicBool::new(true),
        }
    }

    // Broker connection
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(false, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.broker_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.broker_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Routing
    pub fn message_dispatched(&self, handlers_invoked: usize) {
        if handlers_invoked == 0 {
            self.unmatched_messages.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_dispatched.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn handler_failed(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_panicked(&self) {
        self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub fn raw_payload_received(&self) {
        self.raw_payloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn events_lagged(&self, skipped: u64) {
        self.events_lagged.fetch_add(skipped, Ordering::Relaxed);
    }

    // Commands
    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_completed(&self, round_trip: Duration) {
        self.commands_completed.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut times) = self.round_trip_times.lock() {
            times.push(u64::try_from(round_trip.as_millis()).unwrap_or(u64::MAX));
            if times.len() > MAX_ROUND_TRIP_SAMPLES {
                times.remove(0);
            }
        }
    }

    pub fn command_timed_out(&self) {
        self.commands_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_publish_failed(&self) {
        self.commands_publish_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_cancelled(&self) {
        self.commands_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn late_response(&self) {
        self.late_responses.fetch_add(1, Ordering::Relaxed);
    }

    // Device data
    pub fn reading_stored(&self) {
        self.readings_stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reading_rejected(&self) {
        self.readings_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_failed(&self) {
        self.broadcast_failures.fetch_add(1, Ordering::Relaxed);
    }

    // Gateways
    pub fn heartbeat_received(&self) {
        self.heartbeats_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn gateway_timed_out(&self) {
        self.gateways_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_tested(&self, success: bool) {
        self.connection_tests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.connection_test_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Lifecycle
    pub fn set_service_state(&self, state: &str) {
        if let Ok(mut current) = self.service_state.lock() {
            *current = state.to_string();
        }
    }

    pub fn update_health_status(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn is_broker_connected(&self) -> bool {
        self.broker_connected.load(Ordering::Relaxed)
    }

    /// Average, p50 and p95 of recorded command round trips
    fn round_trip_statistics(&self) -> (f64, f64, f64) {
        match self.round_trip_times.lock() {
            Ok(times) if !times.is_empty() => {
                let mut sorted = times.clone();
                sorted.sort_unstable();
                let avg = sorted.iter().sum::<u64>() as f64 / sorted.len() as f64;
                (avg, percentile(&sorted, 50.0), percentile(&sorted, 95.0))
            }
            _ => (0.0, 0.0, 0.0),
        }
    }

    fn connection_duration(&self, now: u64) -> u64 {
        if !self.broker_connected.load(Ordering::Relaxed) {
            return 0;
        }
        let start = self.connection_start_time.load(Ordering::Relaxed);
        if start > 0 {
            now.saturating_sub(start)
        } else {
            0
        }
    }

    /// Get a complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_round_trip_ms, round_trip_p50_ms, round_trip_p95_ms) =
            self.round_trip_statistics();

        MetricsSnapshot {
            broker: BrokerMetrics {
                connected: self.broker_connected.load(Ordering::Relaxed),
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                connection_duration_seconds: self.connection_duration(now),
            },
            routing: RoutingMetrics {
                messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
                unmatched_messages: self.unmatched_messages.load(Ordering::Relaxed),
                handler_failures: self.handler_failures.load(Ordering::Relaxed),
                handler_panics: self.handler_panics.load(Ordering::Relaxed),
                raw_payloads: self.raw_payloads.load(Ordering::Relaxed),
                events_lagged: self.events_lagged.load(Ordering::Relaxed),
            },
            commands: CommandMetrics {
                sent: self.commands_sent.load(Ordering::Relaxed),
                completed: self.commands_completed.load(Ordering::Relaxed),
                timed_out: self.commands_timed_out.load(Ordering::Relaxed),
                publish_failed: self.commands_publish_failed.load(Ordering::Relaxed),
                cancelled: self.commands_cancelled.load(Ordering::Relaxed),
                late_responses: self.late_responses.load(Ordering::Relaxed),
                avg_round_trip_ms,
                round_trip_p50_ms,
                round_trip_p95_ms,
            },
            devices: DeviceMetrics {
                readings_stored: self.readings_stored.load(Ordering::Relaxed),
                readings_rejected: self.readings_rejected.load(Ordering::Relaxed),
                broadcast_failures: self.broadcast_failures.load(Ordering::Relaxed),
            },
            gateways: GatewayMetrics {
                heartbeats_received: self.heartbeats_received.load(Ordering::Relaxed),
                timed_out: self.gateways_timed_out.load(Ordering::Relaxed),
                connection_tests: self.connection_tests.load(Ordering::Relaxed),
                connection_test_failures: self.connection_test_failures.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                current_state: self
                    .service_state
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                healthy: self.healthy.load(Ordering::Relaxed),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub broker: BrokerMetrics,
    pub routing: RoutingMetrics,
    pub commands: CommandMetrics,
    pub devices: DeviceMetrics,
    pub gateways: GatewayMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct BrokerMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_received: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct RoutingMetrics {
    pub messages_dispatched: u64,
    pub unmatched_messages: u64,
    pub handler_failures: u64,
    pub handler_panics: u64,
    pub raw_payloads: u64,
    pub events_lagged: u64,
}

#[derive(Debug, Serialize)]
pub struct CommandMetrics {
    pub sent: u64,
    pub completed: u64,
    pub timed_out: u64,
    pub publish_failed: u64,
    pub cancelled: u64,
    pub late_responses: u64,
    pub avg_round_trip_ms: f64,
    pub round_trip_p50_ms: f64,
    pub round_trip_p95_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct DeviceMetrics {
    pub readings_stored: u64,
    pub readings_rejected: u64,
    pub broadcast_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct GatewayMetrics {
    pub heartbeats_received: u64,
    pub timed_out: u64,
    pub connection_tests: u64,
    pub connection_test_failures: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub healthy: bool,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_values: &[u64], percentile: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_values.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;

    if lower == upper {
        sorted_values[lower] as f64
    } else {
        let weight = index - lower as f64;
        sorted_values[lower] as f64 * (1.0 - weight) + sorted_values[upper] as f64 * weight
    }
}
