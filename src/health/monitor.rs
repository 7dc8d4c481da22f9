//! Per-device health state machine with scheduled re-initialization
//!
//! ```text
//! initializing --ok--> ready
//! initializing|retrying --err--> retrying (timer armed) | failed (retry limit hit)
//! retrying --timer--> initializing
//! any non-ready --force_retry--> initializing (failure count reset)
//! ```
//!
//! Recovery is driven only by the per-device retry timers. The periodic health
//! check is observational and never triggers a retry.

use super::backoff::{RetryDecision, RetryPolicy};
use crate::config::DeviceConfig;
use crate::error::{BridgeError, BridgeResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Performs the full initialization of one device
#[async_trait]
pub trait DeviceInitializer: Send + Sync {
    async fn initialize_device(&self, config: &DeviceConfig) -> BridgeResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Initializing,
    Ready,
    Retrying,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceHealthStatus {
    pub device_id: String,
    pub status: DeviceStatus,
    pub last_attempt: DateTime<Utc>,
    pub failure_count: u32,
    pub next_retry: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl DeviceHealthStatus {
    fn initializing(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            status: DeviceStatus::Initializing,
            last_attempt: Utc::now(),
            failure_count: 0,
            next_retry: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthSummary {
    pub total: usize,
    pub ready: usize,
    pub initializing: usize,
    pub retrying: usize,
    pub failed: usize,
    pub devices: BTreeMap<String, DeviceHealthStatus>,
}

#[derive(Default)]
struct MonitorState {
    health: BTreeMap<String, DeviceHealthStatus>,
    configs: HashMap<String, DeviceConfig>,
    retry_timers: HashMap<String, JoinHandle<()>>,
    closed: bool,
}

pub struct DeviceHealthMonitor {
    policy: RetryPolicy,
    state: Mutex<MonitorState>,
    initializer: Mutex<Option<Weak<dyn DeviceInitializer>>>,
    health_check: Mutex<Option<JoinHandle<()>>>,
    self_ref: Weak<DeviceHealthMonitor>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeviceHealthMonitor {
    pub fn new(policy: RetryPolicy) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            policy,
            state: Mutex::new(MonitorState::default()),
            initializer: Mutex::new(None),
            health_check: Mutex::new(None),
            self_ref: self_ref.clone(),
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Wire the re-initialization callback; held weakly since the initializer owns this monitor
    pub fn set_initializer(&self, initializer: Weak<dyn DeviceInitializer>) {
        *lock(&self.initializer) = Some(initializer);
    }

    /// Register a device; an already-registered device keeps its health record
    pub fn register_device(&self, config: &DeviceConfig) {
        let mut state = lock(&self.state);
        state
            .configs
            .insert(config.device_id.clone(), config.clone());

        if !state.health.contains_key(&config.device_id) {
            state.health.insert(
                config.device_id.clone(),
                DeviceHealthStatus::initializing(&config.device_id),
            );
            info!(
                device_id = %config.device_id,
                thing_name = %config.thing_name,
                "Device registered for health monitoring"
            );
        }
    }

    pub fn mark_device_ready(&self, device_id: &str) {
        let mut state = lock(&self.state);
        let Some(health) = state.health.get_mut(device_id) else {
            return;
        };

        let previous_failures = health.failure_count;
        health.status = DeviceStatus::Ready;
        health.failure_count = 0;
        health.next_retry = None;
        health.error = None;

        if let Some(timer) = state.retry_timers.remove(device_id) {
            timer.abort();
        }

        info!(device_id, previous_failures, "Device marked as ready");
    }

    /// Record a failure and either arm a retry timer or give up
    pub fn mark_device_failed(&self, device_id: &str, error: &str) {
        let mut state = lock(&self.state);
        if state.closed {
            debug!(device_id, error, "Monitor closed, failure not scheduled for retry");
            return;
        }
        let Some(health) = state.health.get_mut(device_id) else {
            return;
        };

        health.failure_count += 1;
        health.last_attempt = Utc::now();
        health.error = Some(error.to_string());
        let failure_count = health.failure_count;

        match self.policy.decide(failure_count) {
            RetryDecision::GiveUp => {
                health.status = DeviceStatus::Failed;
                health.next_retry = None;
                if let Some(timer) = state.retry_timers.remove(device_id) {
                    timer.abort();
                }
                error!(
                    device_id,
                    failure_count,
                    max_retries = ?self.policy.max_retries,
                    error,
                    "Device failed - max retries exceeded"
                );
            }
            RetryDecision::RetryAfter(delay) => {
                health.status = DeviceStatus::Retrying;
                health.next_retry = chrono::Duration::from_std(delay)
                    .ok()
                    .map(|d| Utc::now() + d);
                warn!(
                    device_id,
                    failure_count,
                    retry_in_seconds = delay.as_secs(),
                    error,
                    "Device initialization failed - scheduling retry"
                );
                self.schedule_retry(&mut state, device_id, delay);
            }
        }
    }

    fn schedule_retry(&self, state: &mut MonitorState, device_id: &str, delay: std::time::Duration) {
        if let Some(existing) = state.retry_timers.remove(device_id) {
            existing.abort();
        }

        let monitor = self.self_ref.clone();
        let id = device_id.to_string();
        let span = crate::device_span!(device_id = %id);
        let timer = tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                if let Some(monitor) = monitor.upgrade() {
                    lock(&monitor.state).retry_timers.remove(&id);
                    monitor.attempt_reinit(&id).await;
                }
            }
            .instrument(span),
        );
        state.retry_timers.insert(device_id.to_string(), timer);
    }

    async fn attempt_reinit(&self, device_id: &str) {
        let config = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            let Some(config) = state.configs.get(device_id).cloned() else {
                return;
            };
            let Some(health) = state.health.get_mut(device_id) else {
                return;
            };
            info!(
                device_id,
                attempt = health.failure_count + 1,
                "Attempting device re-initialization"
            );
            health.status = DeviceStatus::Initializing;
            health.last_attempt = Utc::now();
            config
        };

        let initializer = lock(&self.initializer).as_ref().and_then(Weak::upgrade);
        let Some(initializer) = initializer else {
            return;
        };

        match initializer.initialize_device(&config).await {
            Ok(()) => self.mark_device_ready(device_id),
            Err(e) => self.mark_device_failed(device_id, &e.to_string()),
        }
    }

    /// Cancel any pending timer, reset the failure count and re-initialize now
    pub async fn force_retry(&self, device_id: &str) -> BridgeResult<()> {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(BridgeError::internal("Health monitor is closed"));
            }
            let Some(health) = state.health.get_mut(device_id) else {
                return Err(BridgeError::internal(format!(
                    "Device {device_id} not found in health monitor"
                )));
            };

            if health.status == DeviceStatus::Ready {
                warn!(device_id, "Device is already ready, skipping retry");
                return Ok(());
            }

            info!(device_id, "Forcing device retry");
            health.failure_count = 0;
            if let Some(timer) = state.retry_timers.remove(device_id) {
                timer.abort();
            }
        }

        self.attempt_reinit(device_id).await;
        Ok(())
    }

    /// Return a device to a fresh `initializing` record
    pub fn reset_device(&self, device_id: &str) {
        let mut state = lock(&self.state);
        if !state.configs.contains_key(device_id) {
            return;
        }
        if let Some(timer) = state.retry_timers.remove(device_id) {
            timer.abort();
        }
        state.health.insert(
            device_id.to_string(),
            DeviceHealthStatus::initializing(device_id),
        );
        info!(device_id, "Device health reset");
    }

    /// Start the periodic, log-only health check; a second call is a no-op
    pub fn start_health_checks(&self) {
        let mut slot = lock(&self.health_check);
        if slot.is_some() {
            return;
        }

        let interval = self.policy.health_check_interval;
        info!(
            interval_seconds = interval.as_secs(),
            "Starting periodic health checks"
        );

        let monitor = self.self_ref.clone();
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                ticker.tick().await;
                match monitor.upgrade() {
                    Some(monitor) => {
                        monitor.perform_health_check();
                    }
                    None => break,
                }
            }
        }));
    }

    /// Stop the health check and every pending retry timer
    pub fn stop_health_checks(&self) {
        if let Some(handle) = lock(&self.health_check).take() {
            handle.abort();
        }

        let mut state = lock(&self.state);
        for (_, timer) in state.retry_timers.drain() {
            timer.abort();
        }
        info!("Health checks stopped");
    }

    /// Stop health checks for good; later failures no longer arm retries
    pub fn close(&self) {
        lock(&self.state).closed = true;
        self.stop_health_checks();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn health_checks_running(&self) -> bool {
        lock(&self.health_check).is_some()
    }

    /// Log aggregate counts when any device is retrying or failed
    pub fn perform_health_check(&self) -> HealthSummary {
        let summary = self.get_health_summary();
        if summary.failed > 0 || summary.retrying > 0 {
            info!(
                total_devices = summary.total,
                ready = summary.ready,
                retrying = summary.retrying,
                failed = summary.failed,
                "Health check summary"
            );
        }
        summary
    }

    pub fn get_device_health(&self, device_id: &str) -> Option<DeviceHealthStatus> {
        lock(&self.state).health.get(device_id).cloned()
    }

    pub fn get_all_device_health(&self) -> BTreeMap<String, DeviceHealthStatus> {
        lock(&self.state).health.clone()
    }

    pub fn get_health_summary(&self) -> HealthSummary {
        let state = lock(&self.state);
        let mut summary = HealthSummary {
            total: state.health.len(),
            ..HealthSummary::default()
        };

        for (device_id, health) in &state.health {
            match health.status {
                DeviceStatus::Ready => summary.ready += 1,
                DeviceStatus::Initializing => summary.initializing += 1,
                DeviceStatus::Retrying => summary.retrying += 1,
                DeviceStatus::Failed => summary.failed += 1,
            }
            summary.devices.insert(device_id.clone(), health.clone());
        }

        summary
    }

    pub fn has_pending_retry(&self, device_id: &str) -> bool {
        lock(&self.state).retry_timers.contains_key(device_id)
    }
}

impl Drop for DeviceHealthMonitor {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.health_check).take() {
            handle.abort();
        }
        for (_, timer) in lock(&self.state).retry_timers.drain() {
            timer.abort();
        }
    }
}
