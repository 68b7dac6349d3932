//! Testing utilities and mock implementations
//!
//! In-memory stand-ins for the collaborator traits, usable from unit and
//! integration tests without a database or dashboard clients.

pub mod mocks;

pub use mocks::*;
