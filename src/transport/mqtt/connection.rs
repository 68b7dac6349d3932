//! Pure connection state management for the MQTT transport
//!
//! This module contains connection states, reconnect backoff configuration,
//! transport errors, and the pure translation of configuration into rumqttc options.

use crate::config::{AppConfig, ReconnectSection};
use crate::protocol::{SystemStatus, SystemStatusType, TopicBuilder};
use crate::transport::QoS;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::MqttOptions;
use rumqttc::{TlsConfiguration, Transport as RumqttcTransport};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use url::Url;

/// Connection state owned by the connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not connected, with the reason for the last disconnect
    Disconnected(String),
    /// First connection attempt in progress
    Connecting,
    /// Connected and ready for publish/subscribe
    Connected,
    /// Reconnecting after an unexpected disconnect (attempt count)
    Reconnecting(u32),
    /// Closed by the caller or after reconnect attempts were exhausted
    Closed(String),
}

/// Reconnection configuration
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    pub sustained_delay: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: vec![1000, 2000, 5000],
            sustained_delay: 5000,
        }
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            backoff_pattern: section.backoff_ms.clone(),
            sustained_delay: section.sustained_delay_ms,
        }
    }
}

impl ReconnectConfig {
    /// Calculate backoff delay for a 1-based attempt number
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = (attempt.saturating_sub(1)) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Serialization error")]
    SerializationError(#[source] serde_json::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Cannot read TLS material {path}: {source}")]
    TlsMaterial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Connection closed")]
    Closed,
}

/// Resolved broker connection settings
///
/// Built once from configuration; secrets are read from the environment here
/// so that the rest of the transport never touches configuration files.
#[derive(Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub client_id: String,
    pub credentials: Option<(String, String)>,
    pub ca_cert: Option<Vec<u8>>,
    pub client_auth: Option<(Vec<u8>, Vec<u8>)>,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub max_packet_size: u32,
    pub last_will: Option<LastWillSettings>,
    pub connect_timeout: Duration,
}

impl std::fmt::Debug for MqttSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("use_tls", &self.use_tls)
            .field("client_id", &self.client_id)
            .field("has_credentials", &self.credentials.is_some())
            .field("keep_alive", &self.keep_alive)
            .field("clean_session", &self.clean_session)
            .finish()
    }
}

/// Last will as handed to the broker
#[derive(Debug, Clone, PartialEq)]
pub struct LastWillSettings {
    pub topic: String,
    pub payload: String,
    pub qos: QoS,
    pub retain: bool,
}

impl MqttSettings {
    /// Resolve settings from application configuration
    pub fn from_config(config: &AppConfig) -> Result<Self, MqttError> {
        let broker_url = config
            .mqtt
            .broker_url
            .as_deref()
            .ok_or_else(|| MqttError::InvalidBrokerUrl("no broker URL configured".to_string()))?;
        let (host, port, use_tls) = parse_broker_url(broker_url)?;

        let client_id = config
            .mqtt
            .client_id
            .clone()
            .unwrap_or_else(|| generate_client_id(&config.service.id));

        let credentials = config
            .get_mqtt_username()
            .map(|username| (username, config.get_mqtt_password().unwrap_or_default()));

        let ca_cert = config
            .mqtt
            .ca_cert_path
            .as_deref()
            .map(read_tls_material)
            .transpose()?;
        let client_auth = match (&config.mqtt.client_cert_path, &config.mqtt.client_key_path) {
            (Some(cert), Some(key)) => Some((read_tls_material(cert)?, read_tls_material(key)?)),
            _ => None,
        };

        Ok(Self {
            host,
            port,
            use_tls,
            client_id,
            credentials,
            ca_cert,
            client_auth,
            keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs),
            clean_session: config.mqtt.clean_session,
            max_packet_size: config.mqtt.max_packet_size,
            last_will: Some(build_last_will(config)?),
            connect_timeout: Duration::from_secs(10),
        })
    }
}

/// Parse a broker URL into host, port and whether TLS is required
pub fn parse_broker_url(broker_url: &str) -> Result<(String, u16, bool), MqttError> {
    let url =
        Url::parse(broker_url).map_err(|_| MqttError::InvalidBrokerUrl(broker_url.to_string()))?;

    let use_tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(MqttError::InvalidBrokerUrl(broker_url.to_string())),
    };

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(broker_url.to_string()))?
        .to_string();
    let port = url.port().unwrap_or(if use_tls { 8883 } else { 1883 });

    Ok((host, port, use_tls))
}

/// Client identifier unique per process start
fn generate_client_id(service_id: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("ems-{service_id}-{millis}")
}

fn read_tls_material(path: &Path) -> Result<Vec<u8>, MqttError> {
    std::fs::read(path).map_err(|source| MqttError::TlsMaterial {
        path: path.to_path_buf(),
        source,
    })
}

/// Configured last will, or a retained offline status on the system topic
fn build_last_will(config: &AppConfig) -> Result<LastWillSettings, MqttError> {
    if let Some(will) = &config.mqtt.last_will {
        return Ok(LastWillSettings {
            topic: will.topic.clone(),
            payload: will.payload.clone(),
            qos: QoS::from_level(will.qos).unwrap_or_default(),
            retain: will.retain,
        });
    }

    let topics = TopicBuilder::new(&config.mqtt.topic_root);
    let offline = SystemStatus {
        service_id: config.service.id.clone(),
        status: SystemStatusType::Offline,
        timestamp: chrono::Utc::now(),
    };
    let payload = serde_json::to_string(&offline).map_err(MqttError::SerializationError)?;

    Ok(LastWillSettings {
        topic: topics.system_status(),
        payload,
        qos: QoS::AtLeastOnce,
        retain: true,
    })
}

/// Convert to the rumqttc QoS type
pub fn to_rumqttc_qos(qos: QoS) -> rumqttc::v5::mqttbytes::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::v5::mqttbytes::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::v5::mqttbytes::QoS::AtLeastOnce,
        QoS::ExactlyOnce => rumqttc::v5::mqttbytes::QoS::ExactlyOnce,
    }
}

/// Convert from the rumqttc QoS type
pub fn from_rumqttc_qos(qos: rumqttc::v5::mqttbytes::QoS) -> QoS {
    match qos {
        rumqttc::v5::mqttbytes::QoS::AtMostOnce => QoS::AtMostOnce,
        rumqttc::v5::mqttbytes::QoS::AtLeastOnce => QoS::AtLeastOnce,
        rumqttc::v5::mqttbytes::QoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

/// Pure function to configure MQTT options from resolved settings
pub fn configure_mqtt_options(settings: &MqttSettings) -> MqttOptions {
    let mut mqtt_options =
        MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);

    if settings.use_tls {
        let transport = match &settings.ca_cert {
            Some(ca) => RumqttcTransport::tls_with_config(TlsConfiguration::Simple {
                ca: ca.clone(),
                alpn: None,
                client_auth: settings.client_auth.clone(),
            }),
            None => RumqttcTransport::tls_with_default_config(),
        };
        mqtt_options.set_transport(transport);
    }

    if let Some((username, password)) = &settings.credentials {
        mqtt_options.set_credentials(username, password);
    }

    mqtt_options.set_keep_alive(settings.keep_alive);
    mqtt_options.set_clean_start(settings.clean_session);
    mqtt_options.set_max_packet_size(Some(settings.max_packet_size));

    if let Some(will) = &settings.last_will {
        let lwt = LastWill::new(
            &will.topic,
            will.payload.clone(),
            to_rumqttc_qos(will.qos),
            will.retain,
            None,
        );
        mqtt_options.set_last_will(lwt);
    }

    mqtt_options
}
