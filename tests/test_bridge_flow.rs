//! End-to-end flow through the assembled bridge
//!
//! Broker publish -> pool -> bus -> subscription filter -> stream manager -> sink.


use serde_json::json;
use std::time::Duration;
use telemetry_bridge::config::SubscriptionMode;
use telemetry_bridge::health::DeviceStatus;
use telemetry_bridge::stream::StreamStatus;
use telemetry_bridge::transport::BrokerSession;
use telemetry_bridge::DeviceConfig;
use test_helpers::{announce_topics, test_bridge, test_config, test_device, wait_for_device_status};

fn topics(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_selected_mode_only_forwards_listed_topics() {
    let mut device = DeviceConfig::new("dev-1", "dev-1-thing", SubscriptionMode::Selected);
    device.topics.list = topics(&["a/b"]);
    let bridge = test_bridge(test_config(vec![device]));
    announce_topics(&bridge.connector, "dev-1-thing", &topics(&["a/b", "c/d"]));

    bridge.app.start().await.unwrap();
    assert!(wait_for_device_status(bridge.app.pool(), "dev-1", DeviceStatus::Ready).await);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(bridge.app.processing_active());

    assert!(bridge
        .connector
        .deliver("dev-1-thing/a/b", r#"{"value": "21.5", "timestamp": "2024-03-01T10:20:30Z"}"#));
    assert!(bridge.connector.deliver("dev-1-thing/c/d", r#"{"value": 1}"#));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let stream = bridge.app.stream("dev-1").unwrap();
    let queued = stream.queued_messages();
    assert_eq!(queued.len(), 1);
    assert_eq!(bridge.app.metrics().total_messages(), 2);
    assert_eq!(queued[0].topic, "a/b");

    tokio::time::sleep(Duration::from_secs(1)).await;

    let batches = bridge.sink.batches();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    assert_eq!(batch.platform_device_id, "dev-1");
    assert_eq!(batch.routine_id, stream.routine_id());
    assert_eq!(batch.data.len(), 1);
    assert_eq!(batch.data[0].topic, "a/b");
    assert_eq!(batch.data[0].timestamp, "2024-03-01T10:20:30.000Z");
    assert_eq!(batch.data[0].data.data, json!(21.5));
    assert_eq!(batch.data[0].data.value_type, json!("IoTValue"));
    assert_eq!(stream.get_stats().messages_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn test_messages_before_cooldown_are_dropped() {
    let mut config = test_config(vec![test_device("dev-1")]);
    config.bridge.cooldown_secs = 5;
    let bridge = test_bridge(config);
    announce_topics(&bridge.connector, "dev-1-thing", &topics(&["temp"]));

    bridge.app.start().await.unwrap();
    assert!(wait_for_device_status(bridge.app.pool(), "dev-1", DeviceStatus::Ready).await);
    assert!(!bridge.app.processing_active());

    bridge.connector.deliver("dev-1-thing/temp", r#"{"value": 1}"#);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let stream = bridge.app.stream("dev-1").unwrap();
    assert_eq!(stream.get_stats().messages_received, 0);
    assert_eq!(bridge.app.metrics().total_messages(), 0);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(bridge.app.processing_active());

    bridge.connector.deliver("dev-1-thing/temp", r#"{"value": 2}"#);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(stream.get_stats().messages_received, 1);
}

#[tokio::test(start_paused = true)]
async fn test_devices_are_isolated() {
    let bridge = test_bridge(test_config(vec![test_device("dev-1"), test_device("dev-2")]));
    announce_topics(&bridge.connector, "dev-1-thing", &topics(&["temp"]));
    announce_topics(&bridge.connector, "dev-2-thing", &topics(&["temp"]));

    bridge.app.start().await.unwrap();
    assert!(wait_for_device_status(bridge.app.pool(), "dev-2", DeviceStatus::Ready).await);
    tokio::time::sleep(Duration::from_millis(10)).await;

    bridge.connector.deliver("dev-2-thing/temp", r#"{"value": 7}"#);
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(bridge.app.stream("dev-1").unwrap().get_queue_size(), 0);
    assert_eq!(bridge.app.stream("dev-2").unwrap().get_queue_size(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_streaming_starts_paused() {
    let mut config = test_config(vec![test_device("dev-1")]);
    config.stream.parameters.streaming.enabled = false;
    let bridge = test_bridge(config);

    let stream = bridge.app.stream("dev-1").unwrap();
    assert_eq!(stream.get_status(), StreamStatus::Paused);
    assert!(!stream.push_message("temp", "1"));
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_streams_and_connections() {
    let bridge = test_bridge(test_config(vec![test_device("dev-1")]));
    announce_topics(&bridge.connector, "dev-1-thing", &topics(&["temp"]));

    bridge.app.start().await.unwrap();
    assert!(wait_for_device_status(bridge.app.pool(), "dev-1", DeviceStatus::Ready).await);

    bridge.app.shutdown().await.unwrap();

    assert!(bridge.app.is_stopped());
    assert!(!bridge.app.processing_active());
    assert_eq!(
        bridge.app.stream("dev-1").unwrap().get_status(),
        StreamStatus::Stopped
    );
    assert!(bridge.connector.sessions().iter().all(|s| !s.is_connected()));
    assert_eq!(bridge.app.bus().handler_count(), 0);

    bridge.app.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_request_wakes_waiter() {
    let bridge = test_bridge(test_config(vec![test_device("dev-1")]));
    let app = bridge.app.clone();
    let waiter = tokio::spawn(async move { app.wait_for_shutdown_request().await });

    bridge.app.request_shutdown();

    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap();
}
