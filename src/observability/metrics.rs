//! Inbound message processing metrics
//!
//! Counts every message that reaches the subscription filter along with the time
//! spent filtering it, and logs a throughput summary every
//! [`METRICS_LOG_INTERVAL`] messages.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::info;

/// Messages between two throughput log lines
pub const METRICS_LOG_INTERVAL: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingSnapshot {
    pub total_messages: u64,
    pub avg_processing_time_ms: f64,
    pub messages_per_second: f64,
    pub window_ms: u64,
}

pub struct ProcessingMetrics {
    total_messages: AtomicU64,
    total_processing_nanos: AtomicU64,
    last_log: Mutex<Instant>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Default for ProcessingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessingMetrics {
    pub fn new() -> Self {
        Self {
            total_messages: AtomicU64::new(0),
            total_processing_nanos: AtomicU64::new(0),
            last_log: Mutex::new(Instant::now()),
        }
    }

    /// Count one filtered message; returns the logged snapshot on every interval boundary
    pub fn record_message(&self, elapsed: Duration) -> Option<ProcessingSnapshot> {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.total_processing_nanos.fetch_add(nanos, Ordering::Relaxed);
        let total = self.total_messages.fetch_add(1, Ordering::Relaxed) + 1;

        if total % METRICS_LOG_INTERVAL != 0 {
            return None;
        }

        let window = {
            let mut last_log = lock(&self.last_log);
            let now = Instant::now();
            let window = now.duration_since(*last_log);
            *last_log = now;
            window
        };

        let snapshot = ProcessingSnapshot {
            total_messages: total,
            avg_processing_time_ms: round3(self.average_processing_time().as_secs_f64() * 1000.0),
            messages_per_second: (METRICS_LOG_INTERVAL as f64
                / window.as_secs_f64().max(0.001))
            .round(),
            window_ms: window.as_millis() as u64,
        };
        info!(
            total_messages = snapshot.total_messages,
            avg_processing_time_ms = snapshot.avg_processing_time_ms,
            messages_per_second = snapshot.messages_per_second,
            duration_ms = snapshot.window_ms,
            "Performance: message processing batch"
        );
        Some(snapshot)
    }

    pub fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub fn average_processing_time(&self) -> Duration {
        let total = self.total_messages();
        if total == 0 {
            return Duration::ZERO;
        }
        Duration::from_nanos(self.total_processing_nanos.load(Ordering::Relaxed) / total)
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
