//! Telemetry Bridge
//!
//! Connects many IoT devices over MQTT, discovers the topics each device
//! publishes, spreads subscriptions across a pool of broker connections and
//! forwards the telemetry in rate-limited batches to an HTTP endpoint.
//!
//! # Overview
//!
//! - [`pool`] owns the broker connections: discovery, topic allocation and
//!   subscription bookkeeping per device
//! - [`health`] retries failed devices with exponential backoff
//! - [`stream`] buffers telemetry per device and posts batches to the sink
//! - [`command`] translates control requests into device publishes
//! - [`api`] exposes status, stream control and commands over HTTP
//! - [`app`] wires everything together and owns the lifecycle
//!
//! # Quick Start
//!
//! ```rust
//! use telemetry_bridge::command::{plan_command, CommandRequest, CommandType};
//!
//! let request = CommandRequest::new("dev-1", "light/state", "on");
//! let plan = plan_command("thing-1", &request);
//!
//! assert_eq!(plan.target_topic, "thing-1/sub");
//! assert_eq!(plan.command_type, CommandType::StateToCommand);
//! ```

pub mod api;
pub mod app;
pub mod bus;
pub mod command;
pub mod config;
pub mod error;
pub mod health;
pub mod observability;
pub mod pool;
pub mod stream;
pub mod testing;
pub mod transport;

pub use app::BridgeApp;
pub use config::{BridgeConfig, ConfigError, DeviceConfig, SubscriptionMode};
pub use error::{BridgeError, BridgeResult};
pub use pool::ConnectionPoolManager;
pub use stream::StreamManager;
