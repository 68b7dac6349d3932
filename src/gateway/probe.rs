//! Connection tests, one probe per gateway protocol
//!
//! A probe never returns an error: every failure is reported as a
//! [`ConnectionTestOutcome`] whose [`ProbeFailure`] separates timeouts,
//! refused connections, TLS problems and rejected credentials.

use super::credentials::GatewayCredentials;
use super::model::{Gateway, GatewayProtocol};
use crate::error::sanitize_detail;
use crate::transport::mqtt::MqttSettings;
use crate::transport::{Broker, MqttBroker};
use async_trait::async_trait;
use serde::Serialize;
use std::error::Error as StdError;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tracing::debug;
use uuid::Uuid;

/// Why a connection test failed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ProbeFailure {
    Timeout,
    Refused,
    Tls(String),
    Auth(String),
    /// Reachable, but answered with a server error
    HttpStatus(u16),
    Unreachable(String),
    InvalidConfig(String),
}

impl ProbeFailure {
    /// Classify a transport error message
    pub fn from_detail(detail: &str) -> Self {
        let lower = detail.to_lowercase();
        // Brokers reject credentials with a "connection refused" return code
        if lower.contains("timeout") || lower.contains("timed out") {
            ProbeFailure::Timeout
        } else if lower.contains("notauthorized")
            || lower.contains("not authorized")
            || lower.contains("badusername")
            || lower.contains("bad user")
            || lower.contains("unauthorized")
            || lower.contains("authentication")
        {
            ProbeFailure::Auth(sanitize_detail(detail))
        } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("handshake") {
            ProbeFailure::Tls(sanitize_detail(detail))
        } else if lower.contains("refused") {
            ProbeFailure::Refused
        } else {
            ProbeFailure::Unreachable(sanitize_detail(detail))
        }
    }
}

/// Result of one connection test
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestOutcome {
    pub success: bool,
    pub protocol: GatewayProtocol,
    pub latency_ms: Option<u64>,
    pub failure: Option<ProbeFailure>,
    /// Set when the result was simulated rather than measured
    pub simulated: bool,
}

impl ConnectionTestOutcome {
    pub fn succeeded(protocol: GatewayProtocol, latency: Duration) -> Self {
        Self {
            success: true,
            protocol,
            latency_ms: Some(u64::try_from(latency.as_millis()).unwrap_or(u64::MAX)),
            failure: None,
            simulated: false,
        }
    }

    pub fn failed(protocol: GatewayProtocol, failure: ProbeFailure) -> Self {
        Self {
            success: false,
            protocol,
            latency_ms: None,
            failure: Some(failure),
            simulated: false,
        }
    }

    /// One-line description for status reasons and logs
    pub fn summary(&self) -> String {
        match &self.failure {
            None if self.simulated => "simulated success".to_string(),
            None => format!("reachable in {}ms", self.latency_ms.unwrap_or_default()),
            Some(ProbeFailure::Timeout) => "connection timed out".to_string(),
            Some(ProbeFailure::Refused) => "connection refused".to_string(),
            Some(ProbeFailure::Tls(detail)) => format!("TLS error: {detail}"),
            Some(ProbeFailure::Auth(detail)) => format!("authentication rejected: {detail}"),
            Some(ProbeFailure::HttpStatus(status)) => format!("HTTP status {status}"),
            Some(ProbeFailure::Unreachable(detail)) => format!("unreachable: {detail}"),
            Some(ProbeFailure::InvalidConfig(detail)) => format!("invalid configuration: {detail}"),
        }
    }
}

/// Reachability test for one protocol
#[async_trait]
pub trait ConnectionProbe: Send + Sync {
    fn protocol(&self) -> GatewayProtocol;

    async fn test(&self, gateway: &Gateway) -> ConnectionTestOutcome;
}

/// Connect probe for broker-attached gateways
pub struct BrokerProbe {
    timeout: Duration,
    simulate: bool,
}

impl BrokerProbe {
    pub fn new(timeout: Duration, simulate: bool) -> Self {
        Self { timeout, simulate }
    }

    fn settings_for(&self, gateway: &Gateway) -> MqttSettings {
        let (client_id, credentials) = match &gateway.credentials {
            Some(GatewayCredentials::MessageBroker {
                client_id,
                username,
                password,
                ..
            }) => (
                format!("{client_id}-probe"),
                Some((username.clone(), password.clone())),
            ),
            _ => (format!("probe-{}-{}", gateway.id, Uuid::new_v4().simple()), None),
        };

        MqttSettings {
            host: gateway.endpoint.host.clone(),
            port: gateway.endpoint.port,
            use_tls: gateway.endpoint.tls,
            client_id,
            credentials,
            ca_cert: None,
            client_auth: None,
            keep_alive: Duration::from_secs(30),
            clean_session: true,
            max_packet_size: 64 * 1024,
            last_will: None,
            connect_timeout: self.timeout,
        }
    }
}

#[async_trait]
impl ConnectionProbe for BrokerProbe {
    fn protocol(&self) -> GatewayProtocol {
        GatewayProtocol::MessageBroker
    }

    async fn test(&self, gateway: &Gateway) -> ConnectionTestOutcome {
        if self.simulate {
            debug!("Simulating broker probe for gateway {}", gateway.id);
            return ConnectionTestOutcome {
                success: true,
                protocol: GatewayProtocol::MessageBroker,
                latency_ms: Some(0),
                failure: None,
                simulated: true,
            };
        }

        let broker = MqttBroker::new(self.settings_for(gateway));
        let started = Instant::now();
        match broker.connect().await {
            Ok(()) => {
                let latency = started.elapsed();
                if let Err(e) = broker.disconnect().await {
                    debug!("Probe disconnect for {} failed: {}", gateway.id, e);
                }
                ConnectionTestOutcome::succeeded(GatewayProtocol::MessageBroker, latency)
            }
            Err(e) => ConnectionTestOutcome::failed(
                GatewayProtocol::MessageBroker,
                ProbeFailure::from_detail(&error_chain(&e)),
            ),
        }
    }
}

/// Lightweight HTTP reachability probe
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    fn url_for(gateway: &Gateway) -> String {
        let scheme = if gateway.endpoint.tls { "https" } else { "http" };
        let path = gateway.endpoint.path.as_deref().unwrap_or("/");
        let separator = if path.starts_with('/') { "" } else { "/" };
        format!(
            "{scheme}://{}:{}{separator}{path}",
            gateway.endpoint.host, gateway.endpoint.port
        )
    }

    fn classify(error: &reqwest::Error) -> ProbeFailure {
        if error.is_timeout() {
            return ProbeFailure::Timeout;
        }
        if error.is_builder() {
            return ProbeFailure::InvalidConfig(sanitize_detail(&error.to_string()));
        }
        ProbeFailure::from_detail(&error_chain(error))
    }
}

#[async_trait]
impl ConnectionProbe for HttpProbe {
    fn protocol(&self) -> GatewayProtocol {
        GatewayProtocol::Http
    }

    async fn test(&self, gateway: &Gateway) -> ConnectionTestOutcome {
        let url = Self::url_for(gateway);
        let started = Instant::now();

        let mut request = self.client.get(&url);
        if let Some(GatewayCredentials::Http { api_key }) = &gateway.credentials {
            request = request.header("X-API-Key", api_key);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
                    ConnectionTestOutcome::failed(
                        GatewayProtocol::Http,
                        ProbeFailure::Auth(format!("HTTP status {}", status.as_u16())),
                    )
                } else if status.is_server_error() {
                    ConnectionTestOutcome::failed(
                        GatewayProtocol::Http,
                        ProbeFailure::HttpStatus(status.as_u16()),
                    )
                } else {
                    ConnectionTestOutcome::succeeded(GatewayProtocol::Http, started.elapsed())
                }
            }
            Err(e) => ConnectionTestOutcome::failed(GatewayProtocol::Http, Self::classify(&e)),
        }
    }
}

/// Bare socket connect for raw-TCP industrial gateways
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ConnectionProbe for TcpProbe {
    fn protocol(&self) -> GatewayProtocol {
        GatewayProtocol::RawTcp
    }

    async fn test(&self, gateway: &Gateway) -> ConnectionTestOutcome {
        let address = (gateway.endpoint.host.as_str(), gateway.endpoint.port);
        let started = Instant::now();

        match tokio::time::timeout(self.timeout, TcpStream::connect(address)).await {
            Ok(Ok(_stream)) => {
                ConnectionTestOutcome::succeeded(GatewayProtocol::RawTcp, started.elapsed())
            }
            Ok(Err(e)) => {
                let failure = match e.kind() {
                    std::io::ErrorKind::ConnectionRefused => ProbeFailure::Refused,
                    std::io::ErrorKind::TimedOut => ProbeFailure::Timeout,
                    _ => ProbeFailure::Unreachable(sanitize_detail(&e.to_string())),
                };
                ConnectionTestOutcome::failed(GatewayProtocol::RawTcp, failure)
            }
            Err(_) => ConnectionTestOutcome::failed(GatewayProtocol::RawTcp, ProbeFailure::Timeout),
        }
    }
}

/// Join an error with its sources so classification sees the root cause
fn error_chain(error: &dyn StdError) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}
