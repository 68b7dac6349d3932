//! MQTT v5 transport
//!
//! Pure logic is kept apart from I/O so that it can be tested without a broker:
//!
//! - [`connection`] - connection states, reconnect backoff, errors and option building
//! - [`message_handler`] - classification of rumqttc events
//! - [`health_monitor`] - reconnection decisions and health assessment
//! - [`client`] - the rumqttc-backed [`Broker`](crate::transport::Broker) implementation
//!
//! # Usage
//!
//! ```rust,no_run
//! use ems_messaging::config::AppConfig;
//! use ems_messaging::transport::mqtt::{MqttBroker, MqttSettings};
//! use ems_messaging::transport::Broker;
//!
//! # tokio_test::block_on(async {
//! let config = AppConfig::from_toml_str(r#"
//! [service]
//! id = "ems-core"
//!
//! [mqtt]
//! broker_url = "mqtt://localhost:1883"
//! "#)?;
//!
//! let broker = MqttBroker::new(MqttSettings::from_config(&config)?);
//! broker.connect().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::MqttBroker;
pub use connection::{ConnectionState, MqttError, MqttSettings, ReconnectConfig};
pub use health_monitor::{
    ConnectionQuality, HealthMetrics, HealthMonitor, ReconnectionDecision, StateTransition,
};
pub use message_handler::{EventClassifier, EventRoute};
