//! Process uptime tracking

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::time::{Duration, Instant};

struct ProcessStart {
    instant: Instant,
    wall: DateTime<Utc>,
}

static PROCESS_START: Lazy<ProcessStart> = Lazy::new(|| ProcessStart {
    instant: Instant::now(),
    wall: Utc::now(),
});

/// Pin the process start time; call once early in `main`
pub fn mark_process_start() {
    Lazy::force(&PROCESS_START);
}

pub fn started_at() -> DateTime<Utc> {
    PROCESS_START.wall
}

pub fn uptime() -> Duration {
    PROCESS_START.instant.elapsed()
}

/// Render a duration as `1d 2h 3m 4s`, omitting leading zero units
pub fn format_uptime(duration: Duration) -> String {
    let total = duration.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{days}d {hours}h {minutes}m {seconds}s")
    } else if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

pub fn uptime_human() -> String {
    format_uptime(uptime())
}

/// Uptime block embedded in the health and status responses
#[derive(Debug, Clone, Serialize)]
pub struct UptimeStats {
    pub uptime_ms: u128,
    pub uptime_seconds: u64,
    pub uptime_string: String,
    pub start_time: DateTime<Utc>,
}

pub fn uptime_stats() -> UptimeStats {
    let elapsed = uptime();
    UptimeStats {
        uptime_ms: elapsed.as_millis(),
        uptime_seconds: elapsed.as_secs(),
        uptime_string: format_uptime(elapsed),
        start_time: started_at(),
    }
}

/// Process block of the `/health` and `/status` responses
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub uptime: UptimeStats,
    pub pid: u32,
    pub version: &'static str,
    pub platform: &'static str,
    pub arch: &'static str,
}

pub fn system_health() -> SystemHealth {
    SystemHealth {
        uptime: uptime_stats(),
        pid: std::process::id(),
        version: env!("CARGO_PKG_VERSION"),
        platform: std::env::consts::OS,
        arch: std::env::consts::ARCH,
    }
}
