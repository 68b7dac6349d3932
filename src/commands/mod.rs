//! Request/response commands over the broker
//!
//! Commands are published to a device's command topic and correlated with the
//! device's reply by `commandId`. Each command ends in exactly one
//! [`CommandOutcome`]: the response, a timeout, a publish failure or an
//! explicit cancel, whichever happens first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

pub mod correlator;

pub use correlator::{CommandCorrelator, CommandResponseHandler, CommandTicket};

/// Device a command is addressed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTarget {
    pub site_id: String,
    pub device_id: String,
    /// Gateway bridging the device, when there is one
    pub gateway_id: Option<String>,
}

impl CommandTarget {
    pub fn device(site_id: &str, device_id: &str) -> Self {
        Self {
            site_id: site_id.to_string(),
            device_id: device_id.to_string(),
            gateway_id: None,
        }
    }

    pub fn via_gateway(mut self, gateway_id: &str) -> Self {
        self.gateway_id = Some(gateway_id.to_string());
        self
    }
}

/// How a command ended
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The device answered; `success` is the device's own verdict
    Completed { success: bool, response: Value },
    /// No correlated response arrived in time
    TimedOut { after: Duration },
    /// The command never left this process
    PublishFailed { reason: String },
    Cancelled,
}

impl CommandOutcome {
    /// True only for a completed command the device reported as successful
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Completed { success: true, .. })
    }

    /// Short label for logs and API responses
    pub fn label(&self) -> &'static str {
        match self {
            CommandOutcome::Completed { success: true, .. } => "completed",
            CommandOutcome::Completed { success: false, .. } => "rejected",
            CommandOutcome::TimedOut { .. } => "timeout",
            CommandOutcome::PublishFailed { .. } => "publish_failed",
            CommandOutcome::Cancelled => "cancelled",
        }
    }
}

/// Read-only view of an outstanding command
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingCommandInfo {
    pub command_id: Uuid,
    pub target: CommandTarget,
    pub command: String,
    pub parameters: Value,
    pub issued_at: DateTime<Utc>,
    pub timeout_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_outcome_labels_are_distinct() {
        let outcomes = [
            CommandOutcome::Completed {
                success: true,
                response: json!({}),
            },
            CommandOutcome::Completed {
                success: false,
                response: json!({}),
            },
            CommandOutcome::TimedOut {
                after: Duration::from_secs(30),
            },
            CommandOutcome::PublishFailed {
                reason: "not connected".to_string(),
            },
            CommandOutcome::Cancelled,
        ];

        let mut labels: Vec<_> = outcomes.iter().map(CommandOutcome::label).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), outcomes.len());
        assert!(outcomes[0].is_success());
        assert!(!outcomes[1].is_success());
    }

    #[test]
    fn test_target_builder() {
        let target = CommandTarget::device("3", "9").via_gateway("gw-1");
        assert_eq!(target.gateway_id.as_deref(), Some("gw-1"));
        let wire = serde_json::to_value(&target).unwrap();
        assert_eq!(wire["siteId"], "3");
        assert_eq!(wire["deviceId"], "9");
    }
}
