//! Telemetry batching and forwarding

pub mod formatter;
pub mod manager;
pub mod sink;

pub use formatter::{ProcessedTopicData, QueuedMessage, StreamBatchPayload};
pub use manager::{StreamManager, StreamStats, StreamStatus};
pub use sink::{BatchSink, HttpSink, SinkError};
