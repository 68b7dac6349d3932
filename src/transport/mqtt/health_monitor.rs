//! Pure reconnection decisions and connection health assessment
//!
//! Nothing in here performs I/O; the connection manager feeds observations in
//! and acts on the returned decisions.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Messages older than this mark an otherwise connected link as stale
const STALE_MESSAGE_THRESHOLD: Duration = Duration::from_secs(300);

/// Reconnection policy and state transition logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether another reconnect attempt should run
    ///
    /// `attempts_made` counts the failed attempts of the current outage.
    pub fn should_attempt_reconnection(
        attempts_made: u32,
        config: &ReconnectConfig,
        closing: bool,
    ) -> ReconnectionDecision {
        if closing {
            return ReconnectionDecision::AbortClosing;
        }

        if let Some(max_attempts) = config.max_attempts {
            if attempts_made >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = attempts_made + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// State after a lifecycle transition
    pub fn next_state(transition: StateTransition) -> ConnectionState {
        match transition {
            StateTransition::ConnectStarted => ConnectionState::Connecting,
            StateTransition::Acknowledged => ConnectionState::Connected,
            StateTransition::Lost(reason) => ConnectionState::Disconnected(reason),
            StateTransition::ConnectFailed(reason) => ConnectionState::Disconnected(reason),
            StateTransition::ReconnectStarted(attempt) => ConnectionState::Reconnecting(attempt),
            StateTransition::ClosedByCaller => ConnectionState::Closed("closed by caller".to_string()),
            StateTransition::GaveUp(reason) => ConnectionState::Closed(reason),
        }
    }

    /// Publishing is only allowed on an established connection
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }

    /// A closed connection never reconnects on its own
    pub fn is_terminal(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Closed(_))
    }

    /// Calculate health metrics for the connection
    pub fn calculate_health_metrics(
        connected_since: Option<Instant>,
        last_message_at: Option<Instant>,
        reconnect_count: u32,
    ) -> HealthMetrics {
        let now = Instant::now();

        let uptime = connected_since.map(|t| now.duration_since(t));
        let time_since_last_message = last_message_at.map(|t| now.duration_since(t));

        HealthMetrics {
            uptime,
            time_since_last_message,
            reconnect_count,
            is_healthy: Self::determine_health_status(uptime, time_since_last_message),
        }
    }

    fn determine_health_status(
        uptime: Option<Duration>,
        time_since_last_message: Option<Duration>,
    ) -> bool {
        match (uptime, time_since_last_message) {
            (Some(_), None) => true,
            (Some(_), Some(last)) => last < STALE_MESSAGE_THRESHOLD,
            _ => false,
        }
    }

    /// Log a state transition at a level matching its severity
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        match (from, to) {
            (ConnectionState::Connecting, ConnectionState::Connected) => {
                info!("Broker connection established");
            }
            (ConnectionState::Reconnecting(attempt), ConnectionState::Connected) => {
                info!("Reconnected after {} attempt(s)", attempt);
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!("Broker connection lost: {}", reason);
            }
            (_, ConnectionState::Closed(reason)) => {
                error!("Broker connection closed: {}", reason);
            }
            _ => {
                info!("Connection state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Validate reconnect settings before they are used
    pub fn validate_connection_config(config: &ReconnectConfig) -> Result<(), String> {
        if config.max_attempts == Some(0) {
            return Err("max_attempts must be greater than 0 or None for unlimited".to_string());
        }

        if config.backoff_pattern.is_empty() && config.sustained_delay == 0 {
            return Err("must have either backoff_pattern or sustained_delay > 0".to_string());
        }

        Ok(())
    }

    /// Grade the connection from its metrics
    pub fn assess_connection_quality(metrics: &HealthMetrics) -> ConnectionQuality {
        if !metrics.is_healthy {
            return ConnectionQuality::Critical;
        }

        match (metrics.reconnect_count, metrics.uptime) {
            (0, Some(uptime)) if uptime > Duration::from_secs(3600) => ConnectionQuality::Excellent,
            (0, Some(_)) => ConnectionQuality::Good,
            (1..=2, Some(uptime)) if uptime > Duration::from_secs(1800) => ConnectionQuality::Good,
            (1..=2, Some(_)) => ConnectionQuality::Fair,
            (3..=5, _) => ConnectionQuality::Fair,
            (6..=10, _) => ConnectionQuality::Poor,
            _ => ConnectionQuality::Critical,
        }
    }
}

/// Outcome of a reconnection policy check
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay_ms: u64 },
    /// The caller closed the connection
    AbortClosing,
    AbortMaxAttemptsExceeded,
}

/// Lifecycle transitions observed by the connection manager
#[derive(Debug, Clone)]
pub enum StateTransition {
    ConnectStarted,
    Acknowledged,
    Lost(String),
    ConnectFailed(String),
    ReconnectStarted(u32),
    ClosedByCaller,
    GaveUp(String),
}

/// Health metrics for connection monitoring
#[derive(Debug, Clone)]
pub struct HealthMetrics {
    pub uptime: Option<Duration>,
    pub time_since_last_message: Option<Duration>,
    /// Successful reconnects since start
    pub reconnect_count: u32,
    pub is_healthy: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config(max_attempts: Option<u32>) -> ReconnectConfig {
        ReconnectConfig {
            max_attempts,
            backoff_pattern: vec![25, 50, 100],
            sustained_delay: 100,
        }
    }

    #[test]
    fn test_should_attempt_reconnection() {
        let config = fast_config(Some(3));

        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 1,
                delay_ms: 25
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(2, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 3,
                delay_ms: 100
            }
        );
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(3, &config, false),
            ReconnectionDecision::AbortMaxAttemptsExceeded
        );
    }

    #[test]
    fn test_closing_aborts_reconnection() {
        let config = fast_config(None);
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &config, true),
            ReconnectionDecision::AbortClosing
        );
    }

    #[test]
    fn test_unlimited_attempts_use_sustained_delay() {
        let config = fast_config(None);
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(500, &config, false),
            ReconnectionDecision::Proceed {
                attempt: 501,
                delay_ms: 100
            }
        );
    }

    #[test]
    fn test_next_state() {
        assert_eq!(
            HealthMonitor::next_state(StateTransition::Acknowledged),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::next_state(StateTransition::Lost("socket reset".to_string())),
            ConnectionState::Disconnected("socket reset".to_string())
        );
        assert_eq!(
            HealthMonitor::next_state(StateTransition::ReconnectStarted(4)),
            ConnectionState::Reconnecting(4)
        );
        assert!(HealthMonitor::is_terminal(&HealthMonitor::next_state(
            StateTransition::ClosedByCaller
        )));
        assert!(HealthMonitor::is_terminal(&HealthMonitor::next_state(
            StateTransition::GaveUp("max attempts".to_string())
        )));
    }

    #[test]
    fn test_can_publish() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Reconnecting(1)));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Disconnected(
            "x".to_string()
        )));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Closed(
            "x".to_string()
        )));
    }

    #[test]
    fn test_calculate_health_metrics() {
        let now = Instant::now();
        let metrics = HealthMonitor::calculate_health_metrics(
            Some(now - Duration::from_secs(120)),
            Some(now - Duration::from_secs(10)),
            0,
        );
        assert!(metrics.is_healthy);
        assert!(metrics.uptime.unwrap() >= Duration::from_secs(120));

        let disconnected = HealthMonitor::calculate_health_metrics(None, None, 2);
        assert!(!disconnected.is_healthy);
    }

    #[test]
    fn test_stale_messages_are_unhealthy() {
        let now = Instant::now();
        let metrics = HealthMonitor::calculate_health_metrics(
            Some(now - Duration::from_secs(1000)),
            Some(now - Duration::from_secs(600)),
            0,
        );
        assert!(!metrics.is_healthy);
    }

    #[test]
    fn test_validate_connection_config() {
        assert!(HealthMonitor::validate_connection_config(&fast_config(None)).is_ok());
        assert!(HealthMonitor::validate_connection_config(&fast_config(Some(0))).is_err());

        let empty = ReconnectConfig {
            max_attempts: None,
            backoff_pattern: vec![],
            sustained_delay: 0,
        };
        assert!(HealthMonitor::validate_connection_config(&empty).is_err());
    }

    #[test]
    fn test_assess_connection_quality() {
        let metrics = HealthMetrics {
            uptime: Some(Duration::from_secs(7200)),
            time_since_last_message: None,
            reconnect_count: 0,
            is_healthy: true,
        };
        assert_eq!(
            HealthMonitor::assess_connection_quality(&metrics),
            ConnectionQuality::Excellent
        );

        let flaky = HealthMetrics {
            reconnect_count: 8,
            ..metrics.clone()
        };
        assert_eq!(
            HealthMonitor::assess_connection_quality(&flaky),
            ConnectionQuality::Poor
        );

        let down = HealthMetrics {
            is_healthy: false,
            ..metrics
        };
        assert_eq!(
            HealthMonitor::assess_connection_quality(&down),
            ConnectionQuality::Critical
        );
    }
}
