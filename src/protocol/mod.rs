//! Topic matching and wire envelopes for device messaging
//!
//! This module holds the pure parts of the protocol: topic pattern matching with
//! named-parameter extraction, the topic namespace, and the JSON envelopes.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
