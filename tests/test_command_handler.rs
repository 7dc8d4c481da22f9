//! Command handling against a running bridge


use serde_json::{json, Value};
use telemetry_bridge::command::{
    BulkCommandRequest, BulkStatus, CommandRequest, CommandType,
};
use telemetry_bridge::health::DeviceStatus;
use telemetry_bridge::BridgeError;
use test_helpers::{
    announce_topics, test_bridge, test_config, test_device, wait_for_device_status, TestBridge,
};

async fn ready_bridge() -> TestBridge {
    let bridge = test_bridge(test_config(vec![test_device("dev-1")]));
    announce_topics(&bridge.connector, "dev-1-thing", &["light/state".to_string()]);
    bridge.app.start().await.unwrap();
    assert!(wait_for_device_status(bridge.app.pool(), "dev-1", DeviceStatus::Ready).await);
    bridge
}

fn published_json(bridge: &TestBridge, topic: &str) -> Vec<Value> {
    bridge
        .connector
        .published()
        .into_iter()
        .filter(|(t, _)| t == topic)
        .map(|(_, payload)| serde_json::from_slice(&payload).unwrap())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_state_command_is_published_to_control_topic() {
    let bridge = ready_bridge().await;
    let request = CommandRequest::new("dev-1", "light/state", "ON");

    let response = bridge.app.commands().process_command(&request).await.unwrap();

    assert_eq!(response.topic, "dev-1-thing/sub");
    assert_eq!(response.command_type, CommandType::StateToCommand);
    assert_eq!(response.message, "Command sent successfully");
    let commands: Vec<Value> = published_json(&bridge, "dev-1-thing/sub")
        .into_iter()
        .filter(|body| body["type"] == "CMD")
        .collect();
    assert_eq!(
        commands,
        vec![json!({"type": "CMD", "topic_names": ["light/command"], "states": ["ON"]})]
    );
}

#[tokio::test(start_paused = true)]
async fn test_direct_command_publishes_raw_state() {
    let bridge = ready_bridge().await;
    let request = CommandRequest::new("dev-1", "pump/command", "OFF");

    let response = bridge.app.commands().process_command(&request).await.unwrap();

    assert_eq!(response.topic, "dev-1-thing/pump/command");
    assert_eq!(response.command_type, CommandType::DirectCommand);
    assert!(bridge
        .connector
        .published()
        .contains(&("dev-1-thing/pump/command".to_string(), b"OFF".to_vec())));
}

#[tokio::test(start_paused = true)]
async fn test_bulk_command_isolates_failures() {
    let bridge = ready_bridge().await;
    let request = BulkCommandRequest {
        commands: vec![
            CommandRequest::new("dev-1", "light/state", "ON"),
            CommandRequest::new("dev-x", "light/state", "ON"),
            CommandRequest::new("dev-1", "fan", "HIGH"),
        ],
    };

    let response = bridge.app.commands().process_bulk_command(&request).await;

    assert_eq!(response.summary.total, 3);
    assert_eq!(response.summary.successful, 2);
    assert_eq!(response.summary.failed, 1);
    assert_eq!(response.results[1].status, BulkStatus::Error);
    assert_eq!(response.results[1].message, "Command failed");
    assert!(response.results[1]
        .error
        .as_deref()
        .unwrap()
        .contains("dev-x not found in configuration"));
    assert_eq!(response.results[2].command_type, Some(CommandType::CustomTopic));
}

#[tokio::test(start_paused = true)]
async fn test_command_to_undiscovered_device_is_rejected() {
    let bridge = test_bridge(test_config(vec![test_device("dev-1")]));
    bridge.app.start().await.unwrap();

    let result = bridge
        .app
        .commands()
        .process_command(&CommandRequest::new("dev-1", "light/state", "ON"))
        .await;

    let error = result.unwrap_err();
    assert!(matches!(error, BridgeError::DeviceNotReady { .. }));
    assert_eq!(error.status_code(), 409);
}

#[tokio::test(start_paused = true)]
async fn test_validation_messages() {
    let bridge = ready_bridge().await;
    let commands = bridge.app.commands();

    let missing_state = CommandRequest::new("dev-1", "light/state", "");
    let error = commands.validate_request(&missing_state).unwrap_err();
    assert_eq!(error.to_string(), "Validation failed: state is required");

    let mut bad_qos = CommandRequest::new("dev-1", "light/state", "ON");
    bad_qos.qos = 3;
    assert!(commands.validate_request(&bad_qos).is_err());

    let unknown = CommandRequest::new("dev-9", "light/state", "ON");
    let error = commands.validate_request(&unknown).unwrap_err();
    assert_eq!(error.status_code(), 400);
    assert!(error.to_string().contains("Device dev-9 not found in configuration"));
}
