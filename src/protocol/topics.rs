//! Topic matching, parameter extraction and topic namespace construction
//!
//! Patterns and topics are `/`-delimited segment sequences. A pattern segment may be:
//!
//! - `+` - matches exactly one arbitrary segment
//! - `#` - matches zero or more trailing segments (only valid as the last segment)
//! - `:name` - matches exactly one segment and binds it to `name`
//! - anything else - a literal that must match exactly
//!
//! Named-parameter patterns are not understood by brokers, so every pattern also
//! has a broker-subscribable form produced by [`subscription_topic`].

use std::collections::HashMap;
use thiserror::Error;

/// Named segment bindings produced by [`extract`]
pub type TopicParams = HashMap<String, String>;

const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";
const PARAM_SENTINEL: char = ':';

/// One parsed pattern segment
#[derive(Debug, Clone, PartialEq)]
enum PatternSegment<'a> {
    Literal(&'a str),
    SingleLevel,
    MultiLevel,
    Named(&'a str),
}

impl<'a> PatternSegment<'a> {
    fn parse(segment: &'a str) -> Self {
        match segment {
            SINGLE_LEVEL => PatternSegment::SingleLevel,
            MULTI_LEVEL => PatternSegment::MultiLevel,
            other => match other.strip_prefix(PARAM_SENTINEL) {
                Some(name) if !name.is_empty() => PatternSegment::Named(name),
                _ => PatternSegment::Literal(other),
            },
        }
    }

    fn is_wildcard(&self) -> bool {
        !matches!(self, PatternSegment::Literal(_))
    }
}

/// Check whether `topic` is matched by `pattern`
pub fn matches(pattern: &str, topic: &str) -> bool {
    extract(pattern, topic).is_some()
}

/// Match `topic` against `pattern` and return the named bindings
///
/// Returns `None` when the topic does not match. A match with no named
/// segments returns an empty map.
pub fn extract(pattern: &str, topic: &str) -> Option<TopicParams> {
    let pattern_segments: Vec<PatternSegment<'_>> =
        pattern.split('/').map(PatternSegment::parse).collect();
    let topic_segments: Vec<&str> = topic.split('/').collect();

    // System topics ($SYS/...) are never matched by a leading wildcard
    if topic.starts_with('$') && pattern_segments.first().is_some_and(|s| s.is_wildcard()) {
        return None;
    }

    let mut params = TopicParams::new();
    for (index, segment) in pattern_segments.iter().enumerate() {
        match segment {
            PatternSegment::MultiLevel => {
                if index != pattern_segments.len() - 1 {
                    return None;
                }
                return Some(params);
            }
            PatternSegment::SingleLevel => {
                topic_segments.get(index)?;
            }
            PatternSegment::Named(name) => {
                let value = topic_segments.get(index)?;
                params.insert((*name).to_string(), (*value).to_string());
            }
            PatternSegment::Literal(literal) => {
                if topic_segments.get(index) != Some(literal) {
                    return None;
                }
            }
        }
    }

    if pattern_segments.len() == topic_segments.len() {
        Some(params)
    } else {
        None
    }
}

/// Derive the broker-subscribable topic for a handler pattern
///
/// Named-parameter segments become single-level wildcards, so `a/:x/b` and
/// `a/+/b` share the subscription `a/+/b`.
pub fn subscription_topic(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| match PatternSegment::parse(segment) {
            PatternSegment::Named(_) => SINGLE_LEVEL,
            _ => segment,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate a handler pattern before registration
pub fn validate_pattern(pattern: &str) -> Result<(), TopicError> {
    if pattern.is_empty() {
        return Err(TopicError::EmptyPattern);
    }

    let segments: Vec<&str> = pattern.split('/').collect();
    for (index, segment) in segments.iter().enumerate() {
        if *segment == MULTI_LEVEL && index != segments.len() - 1 {
            return Err(TopicError::MisplacedMultiLevel(pattern.to_string()));
        }
        if segment.len() > 1 && (segment.contains('#') || segment.contains('+')) {
            return Err(TopicError::PartialWildcard(segment.to_string()));
        }
    }

    Ok(())
}

/// Normalize a topic: collapse repeated slashes and trim leading/trailing ones
pub fn canonicalize_topic(topic: &str) -> String {
    topic
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate an identifier used as a single topic segment
pub fn validate_segment_id(id: &str) -> Result<(), TopicError> {
    if id.is_empty() {
        return Err(TopicError::EmptyIdentifier);
    }

    for ch in id.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '_' && ch != '-' {
            return Err(TopicError::InvalidIdentifierChar(ch));
        }
    }

    Ok(())
}

/// Topic pattern and identifier errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic pattern cannot be empty")]
    EmptyPattern,
    #[error("Multi-level wildcard must be the last segment: {0}")]
    MisplacedMultiLevel(String),
    #[error("Wildcards must occupy a whole segment: {0}")]
    PartialWildcard(String),
    #[error("Identifier cannot be empty")]
    EmptyIdentifier,
    #[error("Identifier contains invalid character: '{0}'")]
    InvalidIdentifierChar(char),
}

/// Builds concrete topics and handler patterns under a namespace root
///
/// Layout:
///
/// ```text
/// {root}/{siteId}/devices/{deviceId}/telemetry
/// {root}/{siteId}/devices/{deviceId}/status
/// {root}/{siteId}/devices/{deviceId}/commands
/// {root}/{siteId}/devices/{deviceId}/commands/response
/// {root}/{siteId}/energy
/// {root}/system/status
/// {root}/gateways/{gatewayId}/heartbeat
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TopicBuilder {
    root: String,
}

impl TopicBuilder {
    pub fn new(root: &str) -> Self {
        Self {
            root: canonicalize_topic(root),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn device_telemetry(&self, site_id: &str, device_id: &str) -> String {
        format!("{}/{site_id}/devices/{device_id}/telemetry", self.root)
    }

    pub fn device_status(&self, site_id: &str, device_id: &str) -> String {
        format!("{}/{site_id}/devices/{device_id}/status", self.root)
    }

    pub fn device_commands(&self, site_id: &str, device_id: &str) -> String {
        format!("{}/{site_id}/devices/{device_id}/commands", self.root)
    }

    pub fn device_command_response(&self, site_id: &str, device_id: &str) -> String {
        format!("{}/{site_id}/devices/{device_id}/commands/response", self.root)
    }

    pub fn site_energy(&self, site_id: &str) -> String {
        format!("{}/{site_id}/energy", self.root)
    }

    pub fn system_status(&self) -> String {
        format!("{}/system/status", self.root)
    }

    pub fn gateway_heartbeat(&self, gateway_id: &str) -> String {
        format!("{}/gateways/{gateway_id}/heartbeat", self.root)
    }

    /// Pattern binding `siteId` and `deviceId` on device telemetry
    pub fn telemetry_pattern(&self) -> String {
        self.device_telemetry(":siteId", ":deviceId")
    }

    pub fn status_pattern(&self) -> String {
        self.device_status(":siteId", ":deviceId")
    }

    pub fn command_response_pattern(&self) -> String {
        self.device_command_response(":siteId", ":deviceId")
    }

    pub fn energy_pattern(&self) -> String {
        self.site_energy(":siteId")
    }

    pub fn gateway_heartbeat_pattern(&self) -> String {
        self.gateway_heartbeat(":gatewayId")
    }
}
