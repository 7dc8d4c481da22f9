//! Broker connection pooling and topic discovery

pub mod allocator;
pub mod discovery;
pub mod manager;

pub use allocator::{chunk_topics, MAX_TOPICS_PER_CONNECTION};
pub use discovery::{parse_discovery_payload, TopicDiscovery};
pub use manager::{ConnectionPoolManager, DeviceStats, PoolDeviceStatus, PoolStats, PoolTiming};
