//! Configuration system for the device messaging core
//!
//! Configuration is read from a TOML file. Secrets (broker credentials) are never
//! stored in the file; the file names the environment variables holding them and
//! they are resolved at connect time.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub service: ServiceSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub commands: CommandsSection,
    #[serde(default)]
    pub gateways: GatewaysSection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Service identity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceSection {
    /// Service identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
}

/// Broker connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URL (`mqtt://`, `mqtts://`, `tcp://`, `ssl://`).
    /// When absent the in-process broker is used.
    pub broker_url: Option<String>,
    /// Fixed client identifier; generated per connection when absent
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Clean (true) or persistent (false) session
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// PEM CA bundle; enables TLS with a custom root when set
    pub ca_cert_path: Option<PathBuf>,
    /// PEM client certificate for mutual TLS
    pub client_cert_path: Option<PathBuf>,
    /// PEM client key for mutual TLS
    pub client_key_path: Option<PathBuf>,
    /// Root segment of the topic namespace
    #[serde(default = "default_topic_root")]
    pub topic_root: String,
    /// Capacity of the internal event bus
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    /// Overrides the default last will (offline status on the system topic)
    pub last_will: Option<LastWillSection>,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: None,
            client_id: None,
            username_env: None,
            password_env: None,
            keep_alive_secs: default_keep_alive(),
            clean_session: true,
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            topic_root: default_topic_root(),
            event_capacity: default_event_capacity(),
            max_packet_size: default_max_packet_size(),
            last_will: None,
        }
    }
}

/// Last will published by the broker if the connection drops uncleanly
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LastWillSection {
    pub topic: String,
    pub payload: String,
    #[serde(default = "default_qos")]
    pub qos: u8,
    #[serde(default = "default_true")]
    pub retain: bool,
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    /// Maximum reconnect attempts; unlimited when absent
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    #[serde(default = "default_backoff_pattern")]
    pub backoff_ms: Vec<u64>,
    /// Delay used once the pattern is exhausted
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_ms: default_backoff_pattern(),
            sustained_delay_ms: default_sustained_delay(),
        }
    }
}

/// Command correlation settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandsSection {
    #[serde(default = "default_command_timeout")]
    pub default_timeout_ms: u64,
}

impl Default for CommandsSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_command_timeout(),
        }
    }
}

impl CommandsSection {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Gateway supervision settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaysSection {
    #[serde(default = "default_heartbeat_check_interval")]
    pub heartbeat_check_interval_secs: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// Report simulated success for broker probes (non-production mode)
    #[serde(default)]
    pub simulate_broker_probe: bool,
}

impl Default for GatewaysSection {
    fn default() -> Self {
        Self {
            heartbeat_check_interval_secs: default_heartbeat_check_interval(),
            grace_period_secs: default_grace_period(),
            probe_timeout_ms: default_probe_timeout(),
            simulate_broker_probe: false,
        }
    }
}

impl GatewaysSection {
    pub fn heartbeat_check_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_check_interval_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

/// Health HTTP server settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    /// Port for the health server; disabled when absent
    pub port: Option<u16>,
}

fn default_true() -> bool {
    true
}

fn default_keep_alive() -> u64 {
    60
}

fn default_topic_root() -> String {
    "ems".to_string()
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_packet_size() -> u32 {
    256 * 1024
}

fn default_qos() -> u8 {
    1
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![1000, 2000, 5000]
}

fn default_sustained_delay() -> u64 {
    5000
}

fn default_command_timeout() -> u64 {
    30_000
}

fn default_heartbeat_check_interval() -> u64 {
    10
}

fn default_grace_period() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    5000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid service ID format: {0}")]
    InvalidServiceId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_service_id(&self.service.id)?;

        if let Some(broker_url) = &self.mqtt.broker_url {
            let url = Url::parse(broker_url).map_err(|_| {
                ConfigError::InvalidConfig(format!("Invalid broker URL: {broker_url}"))
            })?;
            if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp" | "ssl") {
                return Err(ConfigError::InvalidConfig(format!(
                    "Unsupported broker URL scheme: {}",
                    url.scheme()
                )));
            }
        }

        if self.mqtt.client_cert_path.is_some() != self.mqtt.client_key_path.is_some() {
            return Err(ConfigError::InvalidConfig(
                "client_cert_path and client_key_path must be set together".to_string(),
            ));
        }

        if let Some(will) = &self.mqtt.last_will {
            if will.qos > 2 {
                return Err(ConfigError::InvalidConfig(format!(
                    "last_will.qos must be 0, 1 or 2, got {}",
                    will.qos
                )));
            }
        }

        if self.mqtt.event_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "event_capacity must be greater than 0".to_string(),
            ));
        }

        if self.reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "max_attempts must be greater than 0 or omitted for unlimited".to_string(),
            ));
        }

        if self.reconnect.backoff_ms.is_empty() && self.reconnect.sustained_delay_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "must have either backoff_ms or sustained_delay_ms > 0".to_string(),
            ));
        }

        if self.commands.default_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "commands.default_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.gateways.heartbeat_check_interval_secs == 0 || self.gateways.probe_timeout_ms == 0
        {
            return Err(ConfigError::InvalidConfig(
                "gateway check interval and probe timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Whether the in-process broker replaces a real one
    pub fn uses_memory_broker(&self) -> bool {
        self.mqtt.broker_url.is_none()
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.mqtt.password_env.as_ref())
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[service]
id = "test-service"

[commands]
default_timeout_ms = 500
"#;
        Self::from_toml_str(toml_content).expect("Test config should parse")
    }
}

/// Validate service ID format
fn validate_service_id(service_id: &str) -> Result<(), ConfigError> {
    crate::protocol::validate_segment_id(service_id).map_err(|_| {
        ConfigError::InvalidServiceId(format!(
            "Service ID '{service_id}' must match pattern [a-zA-Z0-9._-]+"
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[service]
id = "ems-core"

[mqtt]
broker_url = "mqtts://broker.example.com:8883"
client_id = "ems-core-1"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
keep_alive_secs = 30
clean_session = false
topic_root = "site-ems"

[mqtt.last_will]
topic = "site-ems/system/status"
payload = "offline"
qos = 1
retain = true

[reconnect]
max_attempts = 20
backoff_ms = [100, 500]
sustained_delay_ms = 1000

[commands]
default_timeout_ms = 15000

[gateways]
heartbeat_check_interval_secs = 5
grace_period_secs = 20
probe_timeout_ms = 2000
simulate_broker_probe = true

[health]
port = 8081
"#;

        let config = AppConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.service.id, "ems-core");
        assert_eq!(
            config.mqtt.broker_url.as_deref(),
            Some("mqtts://broker.example.com:8883")
        );
        assert!(!config.mqtt.clean_session);
        assert_eq!(config.mqtt.topic_root, "site-ems");
        assert_eq!(config.mqtt.last_will.as_ref().unwrap().payload, "offline");
        assert_eq!(config.reconnect.max_attempts, Some(20));
        assert_eq!(config.reconnect.backoff_ms, vec![100, 500]);
        assert_eq!(config.commands.default_timeout(), Duration::from_secs(15));
        assert_eq!(config.gateways.grace_period(), Duration::from_secs(20));
        assert!(config.gateways.simulate_broker_probe);
        assert_eq!(config.health.port, Some(8081));
        assert!(!config.uses_memory_broker());
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_toml_str("[service]\nid = \"minimal\"\n").unwrap();

        assert!(config.uses_memory_broker());
        assert_eq!(config.mqtt.keep_alive_secs, 60);
        assert!(config.mqtt.clean_session);
        assert_eq!(config.mqtt.topic_root, "ems");
        assert_eq!(config.reconnect.max_attempts, None);
        assert_eq!(config.reconnect.backoff_ms, vec![1000, 2000, 5000]);
        assert_eq!(config.commands.default_timeout_ms, 30_000);
        assert_eq!(config.gateways.heartbeat_check_interval_secs, 10);
        assert_eq!(config.gateways.grace_period_secs, 10);
        assert!(!config.gateways.simulate_broker_probe);
        assert_eq!(config.health.port, None);
    }

    #[test]
    fn test_invalid_service_id() {
        let result = AppConfig::from_toml_str("[service]\nid = \"bad/id\"\n");
        assert!(matches!(result, Err(ConfigError::InvalidServiceId(_))));
    }

    #[test]
    fn test_unsupported_broker_scheme() {
        let toml_content = r#"
[service]
id = "svc"

[mqtt]
broker_url = "http://localhost:1883"
"#;
        let result = AppConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_last_will_qos_out_of_range() {
        let toml_content = r#"
[service]
id = "svc"

[mqtt.last_will]
topic = "ems/system/status"
payload = "offline"
qos = 3
"#;
        let result = AppConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_client_cert_requires_key() {
        let toml_content = r#"
[service]
id = "svc"

[mqtt]
broker_url = "mqtts://localhost:8883"
client_cert_path = "/etc/ems/client.pem"
"#;
        let result = AppConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let toml_content = r#"
[service]
id = "svc"

[reconnect]
max_attempts = 0
"#;
        assert!(AppConfig::from_toml_str(toml_content).is_err());
    }

    #[test]
    fn test_credentials_resolved_from_environment() {
        let mut config = AppConfig::test_config();
        config.mqtt.username_env = Some("EMS_TEST_CONFIG_USER_UNSET_VAR".to_string());
        assert_eq!(config.get_mqtt_username(), None);
        assert_eq!(config.get_mqtt_password(), None);
    }
}
