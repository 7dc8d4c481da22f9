//! Device health tracking and backoff-driven recovery

pub mod backoff;
pub mod monitor;

pub use backoff::{RetryDecision, RetryPolicy};
pub use monitor::{
    DeviceHealthMonitor, DeviceHealthStatus, DeviceInitializer, DeviceStatus, HealthSummary,
};
