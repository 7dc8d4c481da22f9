//! Structured logging, processing metrics and process uptime

pub mod logging;
pub mod metrics;
pub mod uptime;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{ProcessingMetrics, ProcessingSnapshot, METRICS_LOG_INTERVAL};
pub use uptime::{
    format_uptime, system_health, uptime, uptime_human, uptime_stats, SystemHealth, UptimeStats,
};

// Span macros for structured logging
pub use logging::{device_span, mqtt_span, stream_span};
