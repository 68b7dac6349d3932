//! Per-protocol gateway credentials
//!
//! Every call produces a complete credential set with fresh random secrets.
//! Secrets are not recoverable afterwards; callers store them immediately.

use super::model::GatewayProtocol;
use crate::protocol::TopicBuilder;
use rand::distr::Alphanumeric;
use rand::{rng, Rng};
use serde::{Deserialize, Serialize};
use std::fmt;

const PASSWORD_LEN: usize = 32;
const API_KEY_LEN: usize = 40;
const CLIENT_SUFFIX_LEN: usize = 8;

/// Highest addressable unit on a serial industrial bus
const MAX_UNIT_ID: u8 = 247;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "kebab-case")]
pub enum GatewayCredentials {
    #[serde(rename_all = "camelCase")]
    MessageBroker {
        client_id: String,
        username: String,
        password: String,
        topic_root: String,
    },
    #[serde(rename_all = "camelCase")]
    Http { api_key: String },
    #[serde(rename_all = "camelCase")]
    RawTcp { unit_id: u8 },
}

impl GatewayCredentials {
    pub fn protocol(&self) -> GatewayProtocol {
        match self {
            GatewayCredentials::MessageBroker { .. } => GatewayProtocol::MessageBroker,
            GatewayCredentials::Http { .. } => GatewayProtocol::Http,
            GatewayCredentials::RawTcp { .. } => GatewayProtocol::RawTcp,
        }
    }
}

impl fmt::Debug for GatewayCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayCredentials::MessageBroker {
                client_id,
                username,
                topic_root,
                ..
            } => f
                .debug_struct("MessageBroker")
                .field("client_id", client_id)
                .field("username", username)
                .field("password", &"<redacted>")
                .field("topic_root", topic_root)
                .finish(),
            GatewayCredentials::Http { .. } => f
                .debug_struct("Http")
                .field("api_key", &"<redacted>")
                .finish(),
            GatewayCredentials::RawTcp { unit_id } => {
                f.debug_struct("RawTcp").field("unit_id", unit_id).finish()
            }
        }
    }
}

fn random_token(len: usize) -> String {
    rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a fresh credential set for a gateway
///
/// # Examples
/// ```
/// use ems_messaging::gateway::{generate_credentials, GatewayCredentials, GatewayProtocol};
/// use ems_messaging::protocol::TopicBuilder;
///
/// let topics = TopicBuilder::new("ems");
/// let first = generate_credentials(GatewayProtocol::Http, "gw-1", &topics);
/// let second = generate_credentials(GatewayProtocol::Http, "gw-1", &topics);
/// assert!(matches!(first, GatewayCredentials::Http { .. }));
/// assert_ne!(first, second);
/// ```
pub fn generate_credentials(
    protocol: GatewayProtocol,
    gateway_id: &str,
    topics: &TopicBuilder,
) -> GatewayCredentials {
    match protocol {
        GatewayProtocol::MessageBroker => GatewayCredentials::MessageBroker {
            client_id: format!(
                "gw-{gateway_id}-{}",
                random_token(CLIENT_SUFFIX_LEN).to_lowercase()
            ),
            username: format!("gateway-{gateway_id}"),
            password: random_token(PASSWORD_LEN),
            topic_root: format!("{}/gateways/{gateway_id}", topics.root()),
        },
        GatewayProtocol::Http => GatewayCredentials::Http {
            api_key: random_token(API_KEY_LEN),
        },
        GatewayProtocol::RawTcp => GatewayCredentials::RawTcp {
            unit_id: rng().random_range(1..=MAX_UNIT_ID),
        },
    }
}
