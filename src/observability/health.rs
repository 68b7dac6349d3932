//! Health check HTTP server for container orchestration
//!
//! Reports broker connectivity, gateway status counts and the metrics
//! snapshot for operators and orchestration probes.

use crate::gateway::GatewayManager;
use crate::observability::metrics::MetricsCollector;
use crate::transport::mqtt::HealthMonitor;
use crate::transport::{ConnectionManager, ConnectionState};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use warp::http::StatusCode;
use warp::Filter;

/// HTTP health check server
pub struct HealthServer {
    service_id: String,
    port: u16,
    connection: Arc<ConnectionManager>,
    gateways: Arc<GatewayManager>,
    metrics: Arc<MetricsCollector>,
    additional_checks: RwLock<HashMap<String, HealthCheck>>,
}

impl HealthServer {
    pub fn new(
        service_id: String,
        port: u16,
        connection: Arc<ConnectionManager>,
        gateways: Arc<GatewayManager>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            service_id,
            port,
            connection,
            gateways,
            metrics,
            additional_checks: RwLock::new(HashMap::new()),
        }
    }

    /// Add custom health check
    pub async fn add_health_check(&self, name: String, check: HealthCheck) {
        self.additional_checks.write().await.insert(name, check);
    }

    pub async fn remove_health_check(&self, name: &str) {
        self.additional_checks.write().await.remove(name);
    }

    /// All routes, without binding a socket
    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        let health_server = self.clone();
        let metrics_server = self.clone();
        let ready_server = self.clone();

        // GET /health - broker and gateway status
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status().await;
                let code = if status.status == "healthy" {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&status), code))
            }
        });

        // GET /metrics - JSON metrics snapshot
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(move || {
            let server = metrics_server.clone();
            async move { Ok::<_, Infallible>(warp::reply::json(&server.metrics.get_metrics())) }
        });

        // GET /ready - readiness probe, ready once the broker is connected
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.connection.is_connected();
                let response = ReadinessResponse {
                    ready,
                    broker_state: state_label(&server.connection.state()),
                    timestamp: current_timestamp(),
                };
                let code = if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(warp::reply::json(&response), code))
            }
        });

        // GET /live - liveness probe
        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Serve until the task is aborted
    pub async fn start(self: Arc<Self>) {
        let routes = self.routes();
        tracing::info!("Starting health server on port {}", self.port);
        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
    }

    async fn get_health_status(&self) -> HealthStatus {
        let mut checks = HashMap::new();
        checks.insert("broker".to_string(), self.check_broker());
        checks.insert("gateways".to_string(), self.check_gateways());

        for (name, check) in self.additional_checks.read().await.iter() {
            checks.insert(name.clone(), check.clone());
        }

        // Gateway errors degrade the report but do not make the service unhealthy
        let healthy = checks
            .iter()
            .all(|(name, check)| check.status == "healthy" || name == "gateways");
        self.metrics.update_health_status(healthy);

        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: current_timestamp(),
            service_id: self.service_id.clone(),
            broker: self.connection.broker_kind().to_string(),
            uptime_seconds: self.metrics.get_metrics().lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_broker(&self) -> HealthCheck {
        let state = self.connection.state();
        if !HealthMonitor::can_publish(&state) {
            return HealthCheck::new("unhealthy", format!("broker {}", state_label(&state)));
        }

        let quality = HealthMonitor::assess_connection_quality(&self.connection.health_metrics());
        HealthCheck::new(
            "healthy",
            format!(
                "broker connected, {} reconnect(s), quality {:?}",
                self.connection.reconnect_count(),
                quality
            ),
        )
    }

    fn check_gateways(&self) -> HealthCheck {
        let counts = self.gateways.status_counts();
        let message = format!(
            "{} connected, {} disconnected, {} error",
            counts.connected, counts.disconnected, counts.error
        );
        if counts.error > 0 {
            HealthCheck::new("degraded", message)
        } else {
            HealthCheck::new("healthy", message)
        }
    }
}

fn state_label(state: &ConnectionState) -> String {
    match state {
        ConnectionState::Disconnected(reason) => format!("disconnected ({reason})"),
        ConnectionState::Connecting => "connecting".to_string(),
        ConnectionState::Connected => "connected".to_string(),
        ConnectionState::Reconnecting(attempt) => format!("reconnecting (attempt {attempt})"),
        ConnectionState::Closed(reason) => format!("closed ({reason})"),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    pub fn new(status: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    service_id: String,
    broker: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    broker_state: String,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
