//! Connection pool behavior against the in-memory broker
//!
//! Covers discovery, topic allocation across data connections, inbound fan-out
//! and publishing, all under paused tokio time.


use std::sync::{Arc, Mutex};
use std::time::Duration;
use telemetry_bridge::bus::MessageBus;
use telemetry_bridge::health::{DeviceStatus, RetryPolicy};
use telemetry_bridge::pool::{ConnectionPoolManager, PoolDeviceStatus};
use telemetry_bridge::testing::MockConnector;
use telemetry_bridge::transport::{BrokerSession, ConnectionRole};
use telemetry_bridge::BridgeError;
use test_helpers::{announce_topics, fast_timing, test_device, topic_names, wait_for_device_status};

fn pool_with(connector: &MockConnector, bus: Arc<MessageBus>) -> Arc<ConnectionPoolManager> {
    ConnectionPoolManager::with_timing(
        Arc::new(connector.clone()),
        bus,
        RetryPolicy::default(),
        fast_timing(),
    )
}

async fn ready_pool(topic_count: usize) -> (MockConnector, Arc<MessageBus>, Arc<ConnectionPoolManager>) {
    let connector = MockConnector::new();
    announce_topics(&connector, "dev-1-thing", &topic_names(topic_count));
    let bus = Arc::new(MessageBus::new());
    let pool = pool_with(&connector, bus.clone());

    pool.initialize(&[test_device("dev-1")]).await.unwrap();
    assert!(wait_for_device_status(&pool, "dev-1", DeviceStatus::Ready).await);
    (connector, bus, pool)
}

#[tokio::test(start_paused = true)]
async fn test_large_topic_set_is_split_across_connections() {
    let (connector, _bus, pool) = ready_pool(120).await;

    let data = connector.data_sessions_for("dev-1");
    let sizes: Vec<usize> = data.iter().map(|s| s.subscriptions().len()).collect();
    assert_eq!(sizes, vec![50, 50, 20]);
    assert_eq!(data[0].subscriptions()[0], "dev-1-thing/sensor/0/value");
    assert_eq!(data[2].subscriptions()[19], "dev-1-thing/sensor/119/value");

    let stats = pool.get_stats();
    let device = &stats.devices["dev-1"];
    assert_eq!(device.connections, 4);
    assert_eq!(device.topics_discovered, 120);
    assert_eq!(device.topics_subscribed, 120);
    assert_eq!(device.status, PoolDeviceStatus::Ready);
    assert_eq!(stats.devices_ready, 1);
    assert_eq!(pool.subscribed_topics("dev-1").len(), 120);
}

#[tokio::test(start_paused = true)]
async fn test_each_data_connection_announces_its_chunk() {
    let (connector, _bus, _pool) = ready_pool(60).await;

    let data = connector.data_sessions_for("dev-1");
    assert_eq!(data.len(), 2);

    let (topic, payload) = &data[1].published()[0];
    assert_eq!(topic, "dev-1-thing/sub");
    let body: serde_json::Value = serde_json::from_slice(payload).unwrap();
    assert_eq!(body["type"], "AddTopics");
    assert_eq!(body["topic_names"].as_array().unwrap().len(), 10);
    assert_eq!(body["topic_names"][0], "sensor/50/value");
}

#[tokio::test(start_paused = true)]
async fn test_discovery_topic_is_unsubscribed_after_discovery() {
    let (connector, _bus, pool) = ready_pool(3).await;

    let discovery: Vec<_> = connector
        .sessions_for("dev-1")
        .into_iter()
        .filter(|s| s.spec.role == ConnectionRole::Discovery)
        .collect();
    assert_eq!(discovery.len(), 1);
    assert_eq!(discovery[0].unsubscribed(), vec!["dev-1-thing/topics".to_string()]);
    assert!(!pool
        .subscribed_topics("dev-1")
        .contains(&"dev-1-thing/topics".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_discovery_timeout_schedules_retry() {
    let connector = MockConnector::new();
    let pool = pool_with(&connector, Arc::new(MessageBus::new()));

    pool.initialize(&[test_device("dev-1")]).await.unwrap();

    assert!(wait_for_device_status(&pool, "dev-1", DeviceStatus::Retrying).await);
    let health = pool.get_device_health("dev-1").unwrap();
    assert_eq!(health.failure_count, 1);
    assert!(health.error.unwrap().contains("discovery timeout"));
    assert!(health.next_retry.is_some());
    assert_eq!(
        pool.get_stats().devices["dev-1"].status,
        PoolDeviceStatus::Discovering
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_discovery_subscription_fails_device() {
    let connector = MockConnector::new();
    connector.reject_subscription("dev-1-thing/topics");
    let pool = pool_with(&connector, Arc::new(MessageBus::new()));

    let result = pool.initialize_device(&test_device("dev-1")).await;

    assert!(matches!(result, Err(BridgeError::Connection { .. })));
    assert!(connector.data_sessions_for("dev-1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_inbound_messages_reach_bus_without_prefix() {
    let (connector, bus, pool) = ready_pool(2).await;
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    bus.add_handler(Arc::new(move |device: &str, topic: &str, payload: &str| {
        sink.lock()
            .unwrap()
            .push((device.to_string(), topic.to_string(), payload.to_string()));
    }));

    assert!(connector.deliver("dev-1-thing/sensor/1/value", r#"{"value": 21.5}"#));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let received = received.lock().unwrap().clone();
    assert_eq!(
        received,
        vec![(
            "dev-1".to_string(),
            "sensor/1/value".to_string(),
            r#"{"value": 21.5}"#.to_string()
        )]
    );
    assert_eq!(pool.get_stats().total_messages_received, 1);
    assert_eq!(pool.get_stats().devices["dev-1"].messages_received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_discovery_payload_is_ignored() {
    let (connector, _bus, pool) = ready_pool(2).await;
    let discovery = connector
        .sessions_for("dev-1")
        .into_iter()
        .find(|s| s.spec.role == ConnectionRole::Discovery)
        .unwrap();

    discovery.inject("dev-1-thing/topics", r#"["x", "y", "z"]"#);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(pool.get_stats().devices["dev-1"].topics_discovered, 2);
}

#[tokio::test(start_paused = true)]
async fn test_publish_uses_thing_prefix() {
    let (connector, _bus, pool) = ready_pool(2).await;

    pool.publish("dev-1", "light/command", b"on".to_vec())
        .await
        .unwrap();

    assert!(connector
        .published()
        .contains(&("dev-1-thing/light/command".to_string(), b"on".to_vec())));
}

#[tokio::test(start_paused = true)]
async fn test_publish_without_live_connection_fails() {
    let (connector, _bus, pool) = ready_pool(2).await;

    let unknown = pool.publish("dev-9", "light/command", b"on".to_vec()).await;
    assert!(matches!(unknown, Err(BridgeError::NotConnected { .. })));

    for session in connector.sessions_for("dev-1") {
        session.set_connected(false);
    }
    let dropped = pool.publish("dev-1", "light/command", b"on".to_vec()).await;
    assert!(matches!(dropped, Err(BridgeError::NotConnected { .. })));
    assert_eq!(pool.get_stats().connected_connections, 0);
}

#[tokio::test(start_paused = true)]
async fn test_refused_connection_recovers_on_retry() {
    let connector = MockConnector::new();
    announce_topics(&connector, "dev-1-thing", &topic_names(5));
    connector.fail_connects("dev-1", 1);
    let pool = pool_with(&connector, Arc::new(MessageBus::new()));

    pool.initialize(&[test_device("dev-1")]).await.unwrap();
    assert!(wait_for_device_status(&pool, "dev-1", DeviceStatus::Retrying).await);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(wait_for_device_status(&pool, "dev-1", DeviceStatus::Ready).await);
    assert_eq!(pool.get_device_health("dev-1").unwrap().failure_count, 0);
    assert_eq!(connector.data_sessions_for("dev-1").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_closes_everything() {
    let (connector, bus, pool) = ready_pool(60).await;
    bus.add_handler(Arc::new(|_: &str, _: &str, _: &str| {}));

    pool.disconnect().await;

    assert!(connector.sessions().iter().all(|s| !s.is_connected()));
    let stats = pool.get_stats();
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.total_devices, 0);
    assert_eq!(bus.handler_count(), 0);
    assert!(!pool.health_monitor().health_checks_running());
    assert!(pool.health_monitor().is_closed());

    // A second call is a no-op
    pool.disconnect().await;
}
