//! Testing utilities and mock implementations
//!
//! In-memory stand-ins for the broker and the ingestion sink, so the pool,
//! stream and command layers can be exercised without a real MQTT broker or
//! HTTP endpoint.

pub mod mocks;

pub use mocks::*;
