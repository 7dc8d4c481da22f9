//! Per-device batching and delivery
//!
//! Messages are queued FIFO and flushed on a fixed interval. A failed batch goes
//! back to the front of the queue, immediately for the first three consecutive
//! failures and after an exponential delay from then on. Delivery is retried
//! forever with no dead-letter queue and no upstream backpressure.

use super::formatter::{self, QueuedMessage};
use super::sink::BatchSink;
use crate::config::DeviceConfig;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Consecutive failures tolerated before re-queueing is delayed
const IMMEDIATE_RETRY_LIMIT: u32 = 3;

/// Upper bound on the re-queue delay
const MAX_SINK_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStats {
    pub messages_received: u64,
    pub batches_sent: u64,
    pub messages_sent: u64,
    pub errors: u64,
    pub last_batch_time: Option<String>,
    pub last_error: Option<String>,
    pub queue_size: usize,
    pub status: StreamStatus,
}

/// Delay before a failed batch is re-queued, `None` when it goes back immediately
pub fn sink_backoff(rate: Duration, consecutive_errors: u32) -> Option<Duration> {
    if consecutive_errors <= IMMEDIATE_RETRY_LIMIT {
        return None;
    }
    let factor = 1u32
        .checked_shl(consecutive_errors - IMMEDIATE_RETRY_LIMIT)
        .unwrap_or(u32::MAX);
    Some(rate.saturating_mul(factor).min(MAX_SINK_BACKOFF))
}

struct StreamState {
    queue: VecDeque<QueuedMessage>,
    status: StreamStatus,
    messages_received: u64,
    batches_sent: u64,
    messages_sent: u64,
    errors: u64,
    last_batch_time: Option<String>,
    last_error: Option<String>,
    consecutive_errors: u32,
}

pub struct StreamManager {
    device_id: String,
    routine_id: String,
    metadata: Map<String, Value>,
    rate: Duration,
    sink: Arc<dyn BatchSink>,
    state: Mutex<StreamState>,
    batch_task: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    self_ref: Weak<StreamManager>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StreamManager {
    /// Create the manager and start its batch timer
    pub fn new(
        device: &DeviceConfig,
        rate: Duration,
        start_paused: bool,
        sink: Arc<dyn BatchSink>,
    ) -> Arc<Self> {
        let routine_id = uuid::Uuid::new_v4().to_string();
        let status = if start_paused {
            StreamStatus::Paused
        } else {
            StreamStatus::Running
        };

        let manager = Arc::new_cyclic(|self_ref| Self {
            device_id: device.device_id.clone(),
            routine_id,
            metadata: device.metadata.clone().unwrap_or_default(),
            rate,
            sink,
            state: Mutex::new(StreamState {
                queue: VecDeque::new(),
                status,
                messages_received: 0,
                batches_sent: 0,
                messages_sent: 0,
                errors: 0,
                last_batch_time: None,
                last_error: None,
                consecutive_errors: 0,
            }),
            batch_task: Mutex::new(None),
            stop_tx: watch::channel(false).0,
            self_ref: self_ref.clone(),
        });

        info!(
            device_id = %manager.device_id,
            routine_id = %manager.routine_id,
            batch_rate_ms = rate.as_millis() as u64,
            "Stream manager initialized"
        );
        manager.start_batch_processor();
        manager
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn routine_id(&self) -> &str {
        &self.routine_id
    }

    pub fn rate(&self) -> Duration {
        self.rate
    }

    fn start_batch_processor(&self) {
        let manager = self.self_ref.clone();
        let rate = self.rate;
        let span = crate::stream_span!(device_id = %self.device_id, routine_id = %self.routine_id);
        let mut stop_rx = self.stop_tx.subscribe();

        let handle = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + rate, rate);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    // A batch already in flight finishes before the stop is observed
                    tokio::select! {
                        biased;
                        _ = stop_rx.changed() => break,
                        _ = ticker.tick() => {}
                    }
                    let Some(manager) = manager.upgrade() else {
                        break;
                    };
                    if manager.get_status() == StreamStatus::Running {
                        manager.process_batch().await;
                    }
                }
            }
            .instrument(span),
        );

        *lock(&self.batch_task) = Some(handle);
    }

    /// Queue a raw payload; rejected unless the stream is running
    pub fn push_message(&self, topic: &str, payload: &str) -> bool {
        let mut state = lock(&self.state);
        if state.status != StreamStatus::Running {
            warn!(
                device_id = %self.device_id,
                topic,
                status = ?state.status,
                "Message rejected - not running"
            );
            return false;
        }

        let data: Value = serde_json::from_str(payload).unwrap_or_else(|_| {
            let mut wrapped = Map::new();
            wrapped.insert("value".to_string(), Value::String(payload.to_string()));
            Value::Object(wrapped)
        });

        let timestamp = match data.get("timestamp") {
            Some(Value::String(ts)) if !ts.is_empty() => ts.clone(),
            _ => formatter::now_iso(),
        };

        state.queue.push_back(QueuedMessage {
            topic: topic.to_string(),
            timestamp,
            data,
        });
        state.messages_received += 1;

        debug!(
            device_id = %self.device_id,
            topic,
            queue_size = state.queue.len(),
            "Message queued"
        );
        true
    }

    /// Drain the queue and deliver it as one batch
    pub async fn process_batch(&self) {
        let messages: Vec<QueuedMessage> = {
            let mut state = lock(&self.state);
            if state.queue.is_empty() {
                return;
            }
            state.queue.drain(..).collect()
        };

        info!(
            device_id = %self.device_id,
            message_count = messages.len(),
            "Processing batch"
        );

        let payload = formatter::format_batch(
            &self.device_id,
            &self.routine_id,
            &messages,
            Some(&self.metadata),
        );
        debug!("{}", formatter::summarize_payload(&payload));

        let started = Instant::now();
        match self.sink.send(&payload).await {
            Ok(status_code) => {
                let mut state = lock(&self.state);
                state.batches_sent += 1;
                state.messages_sent += messages.len() as u64;
                state.last_batch_time = Some(formatter::now_iso());
                state.consecutive_errors = 0;
                info!(
                    device_id = %self.device_id,
                    message_count = messages.len(),
                    response_time_ms = started.elapsed().as_millis() as u64,
                    status_code,
                    "Batch sent successfully"
                );
            }
            Err(e) => self.handle_batch_error(e.to_string(), messages),
        }
    }

    fn handle_batch_error(&self, message: String, messages: Vec<QueuedMessage>) {
        let consecutive_errors = {
            let mut state = lock(&self.state);
            state.consecutive_errors += 1;
            state.errors += 1;
            state.last_error = Some(message.clone());
            state.consecutive_errors
        };

        error!(
            device_id = %self.device_id,
            message_count = messages.len(),
            error = %message,
            consecutive_errors,
            "Failed to send batch"
        );

        match sink_backoff(self.rate, consecutive_errors) {
            Some(delay) => {
                warn!(
                    device_id = %self.device_id,
                    delay_ms = delay.as_millis() as u64,
                    consecutive_errors,
                    "Applying backoff delay"
                );
                let manager = self.self_ref.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(manager) = manager.upgrade() {
                        manager.requeue_front(messages);
                    }
                });
            }
            None => self.requeue_front(messages),
        }
    }

    fn requeue_front(&self, messages: Vec<QueuedMessage>) {
        let mut state = lock(&self.state);
        for message in messages.into_iter().rev() {
            state.queue.push_front(message);
        }
    }

    pub fn pause(&self) {
        let mut state = lock(&self.state);
        if state.status == StreamStatus::Stopped {
            warn!(device_id = %self.device_id, "Cannot pause a stopped stream");
            return;
        }
        state.status = StreamStatus::Paused;
        info!(device_id = %self.device_id, "Stream paused");
    }

    pub fn resume(&self) {
        let mut state = lock(&self.state);
        if state.status == StreamStatus::Stopped {
            warn!(device_id = %self.device_id, "Cannot resume a stopped stream");
            return;
        }
        state.status = StreamStatus::Running;
        info!(device_id = %self.device_id, "Stream resumed");
    }

    /// Stop permanently and end the batch timer
    ///
    /// A delivery already in progress runs to completion, so its batch is either
    /// sent or put back on the queue.
    pub fn stop(&self) {
        lock(&self.state).status = StreamStatus::Stopped;
        self.stop_tx.send_replace(true);
        info!(device_id = %self.device_id, "Stream stopped");
    }

    /// Empty the queue, returning how many messages were dropped
    pub fn clear_queue(&self) -> usize {
        let mut state = lock(&self.state);
        let cleared = state.queue.len();
        state.queue.clear();
        info!(device_id = %self.device_id, cleared_messages = cleared, "Queue cleared");
        cleared
    }

    pub fn get_status(&self) -> StreamStatus {
        lock(&self.state).status
    }

    pub fn get_queue_size(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn get_stats(&self) -> StreamStats {
        let state = lock(&self.state);
        StreamStats {
            messages_received: state.messages_received,
            batches_sent: state.batches_sent,
            messages_sent: state.messages_sent,
            errors: state.errors,
            last_batch_time: state.last_batch_time.clone(),
            last_error: state.last_error.clone(),
            queue_size: state.queue.len(),
            status: state.status,
        }
    }

    /// Snapshot of the queued messages, oldest first
    pub fn queued_messages(&self) -> Vec<QueuedMessage> {
        lock(&self.state).queue.iter().cloned().collect()
    }
}

impl Drop for StreamManager {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.batch_task).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriptionMode;
    use crate::testing::RecordingSink;
    use serde_json::json;

    fn device() -> DeviceConfig {
        DeviceConfig::new("dev-1", "thing-1", SubscriptionMode::All)
    }

    #[test]
    fn test_sink_backoff_schedule() {
        let rate = Duration::from_millis(5000);
        assert_eq!(sink_backoff(rate, 1), None);
        assert_eq!(sink_backoff(rate, 3), None);
        assert_eq!(sink_backoff(rate, 4), Some(Duration::from_millis(10_000)));
        assert_eq!(sink_backoff(rate, 5), Some(Duration::from_millis(20_000)));
        assert_eq!(sink_backoff(rate, 6), Some(Duration::from_millis(30_000)));
        assert_eq!(sink_backoff(rate, 60), Some(Duration::from_millis(30_000)));
        assert_eq!(
            sink_backoff(Duration::from_millis(100), 4),
            Some(Duration::from_millis(200))
        );
    }

    #[tokio::test]
    async fn test_push_while_running_and_paused() {
        let manager = StreamManager::new(
            &device(),
            Duration::from_secs(60),
            false,
            Arc::new(RecordingSink::new()),
        );

        assert!(manager.push_message("t1", r#"{"value": 1}"#));
        let stats = manager.get_stats();
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.messages_received, 1);

        manager.pause();
        assert!(!manager.push_message("t1", r#"{"value": 2}"#));
        let stats = manager.get_stats();
        assert_eq!(stats.queue_size, 1);
        assert_eq!(stats.messages_received, 1);
        assert_eq!(stats.status, StreamStatus::Paused);
    }

    #[tokio::test]
    async fn test_non_json_payload_is_wrapped() {
        let manager = StreamManager::new(
            &device(),
            Duration::from_secs(60),
            false,
            Arc::new(RecordingSink::new()),
        );
        manager.push_message("t1", "ON");
        manager.push_message("t2", r#"{"value": 3, "timestamp": "2024-03-01T10:20:30Z"}"#);

        let queued = manager.queued_messages();
        assert_eq!(queued[0].data, json!({"value": "ON"}));
        assert_eq!(queued[1].timestamp, "2024-03-01T10:20:30Z");
    }

    #[tokio::test]
    async fn test_start_paused_and_stop_is_terminal() {
        let manager = StreamManager::new(
            &device(),
            Duration::from_secs(60),
            true,
            Arc::new(RecordingSink::new()),
        );
        assert_eq!(manager.get_status(), StreamStatus::Paused);

        manager.resume();
        assert_eq!(manager.get_status(), StreamStatus::Running);

        manager.stop();
        manager.resume();
        assert_eq!(manager.get_status(), StreamStatus::Stopped);
        assert!(!manager.push_message("t1", "1"));
    }

    #[tokio::test]
    async fn test_clear_queue_returns_count() {
        let manager = StreamManager::new(
            &device(),
            Duration::from_secs(60),
            false,
            Arc::new(RecordingSink::new()),
        );
        for i in 0..3 {
            manager.push_message("t", &i.to_string());
        }
        assert_eq!(manager.clear_queue(), 3);
        assert_eq!(manager.get_queue_size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_flushes_on_interval() {
        let sink = Arc::new(RecordingSink::new());
        let manager = StreamManager::new(&device(), Duration::from_millis(5000), false, sink.clone());
        manager.push_message("t1", r#"{"value": 1}"#);

        tokio::time::sleep(Duration::from_millis(4900)).await;
        assert!(sink.batches().is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);

        let record = serde_json::to_value(&batches[0].data[0]).unwrap();
        assert_eq!(record["topic"], "t1");
        assert_eq!(record["data"], json!({"type": "IoTValue", "data": 1}));
        assert!(chrono::DateTime::parse_from_rfc3339(record["timestamp"].as_str().unwrap()).is_ok());

        let stats = manager.get_stats();
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.queue_size, 0);
        assert!(stats.last_batch_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_requeued_ahead_of_new_messages() {
        let sink = Arc::new(RecordingSink::failing(1));
        let manager = StreamManager::new(&device(), Duration::from_millis(100), false, sink.clone());
        manager.push_message("first", "1");

        tokio::time::sleep(Duration::from_millis(150)).await;
        let stats = manager.get_stats();
        assert_eq!(stats.errors, 1);
        assert!(stats.last_error.is_some());

        manager.push_message("second", "2");
        let topics: Vec<String> = manager
            .queued_messages()
            .into_iter()
            .map(|m| m.topic)
            .collect();
        assert_eq!(topics, vec!["first", "second"]);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let delivered = sink.batches();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].data.len(), 2);
        assert_eq!(delivered[0].data[0].topic, "first");
        assert_eq!(manager.get_stats().batches_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_requeues_batch_that_fails_in_flight() {
        let sink = Arc::new(RecordingSink::failing(1).with_delay(Duration::from_millis(500)));
        let manager = StreamManager::new(&device(), Duration::from_millis(100), false, sink.clone());
        manager.push_message("t1", r#"{"value": 1}"#);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sink.attempts(), 1);
        assert_eq!(manager.get_queue_size(), 0);

        manager.stop();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let stats = manager.get_stats();
        assert_eq!(stats.status, StreamStatus::Stopped);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.queue_size, 1);
        assert_eq!(manager.queued_messages()[0].topic, "t1");
        assert_eq!(sink.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_batch_complete() {
        let sink = Arc::new(RecordingSink::new().with_delay(Duration::from_millis(500)));
        let manager = StreamManager::new(&device(), Duration::from_millis(100), false, sink.clone());
        manager.push_message("t1", r#"{"value": 1}"#);

        tokio::time::sleep(Duration::from_millis(150)).await;
        manager.stop();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let stats = manager.get_stats();
        assert_eq!(stats.batches_sent, 1);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.queue_size, 0);
        assert_eq!(sink.batches().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_routine_id_is_stable_per_manager() {
        let sink = Arc::new(RecordingSink::new());
        let manager = StreamManager::new(&device(), Duration::from_millis(100), false, sink.clone());

        manager.push_message("t", "1");
        tokio::time::sleep(Duration::from_millis(150)).await;
        manager.push_message("t", "2");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].routine_id, manager.routine_id());
        assert_eq!(batches[1].routine_id, manager.routine_id());
        assert_eq!(batches[0].metadata, Some(Map::new()));
    }
}
