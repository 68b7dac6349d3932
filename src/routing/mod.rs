//! Topic-based dispatch of inbound messages
//!
//! Handlers register against topic patterns (with `+`, `#` and `:name`
//! segments). The router derives the broker subscription for each pattern,
//! keeps broker subscriptions in step with registrations and feeds every
//! inbound message to each matching handler with the extracted parameters.

use crate::collaborators::PersistenceError;
use crate::protocol::{DecodedPayload, TopicError, TopicParams};
use crate::transport::{MqttError, QoS};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

pub mod router;

pub use router::{HandlerId, MessageRouter};

/// A message as seen by handlers
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: DecodedPayload,
    /// Named segments bound by the handler's pattern
    pub params: TopicParams,
    pub retained: bool,
    pub qos: QoS,
}

impl InboundMessage {
    /// Value of a named topic parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    /// Value of a named topic parameter, or an invalid-payload error
    pub fn require_param(&self, name: &str) -> Result<&str, HandlerError> {
        self.param(name).ok_or_else(|| {
            HandlerError::InvalidPayload(format!("topic {} has no '{}' segment", self.topic, name))
        })
    }
}

/// Failures reported by message handlers
///
/// The router logs these; they never stop delivery to other handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Unknown gateway: {0}")]
    UnknownGateway(String),
    #[error("Persistence failure: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("{0}")]
    Other(String),
}

/// Router configuration errors
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Invalid topic pattern: {0}")]
    InvalidPattern(#[from] TopicError),
    #[error("Subscription failed: {0}")]
    Subscription(#[from] MqttError),
}

/// Receives messages whose topic matches a registered pattern
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError>;

    /// Name used in logs
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    name: String,
    func: F,
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        (self.func)(message.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap an async closure as a handler
///
/// # Examples
/// ```
/// use ems_messaging::routing::{handler_fn, MessageHandler};
///
/// let handler = handler_fn("log-energy", |message| async move {
///     println!("energy on {}", message.topic);
///     Ok(())
/// });
/// assert_eq!(handler.name(), "log-energy");
/// ```
pub fn handler_fn<F, Fut>(name: &str, func: F) -> Arc<dyn MessageHandler>
where
    F: Fn(InboundMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.to_string(),
        func,
    })
}
