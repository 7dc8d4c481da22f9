//! Request handlers of the control API
//!
//! Every handler resolves to a complete [`Response`]; failures are rendered in
//! the shared error shape rather than surfacing as warp rejections.

use super::errors::{bridge_error_reply, error_reply, not_found};
use crate::app::BridgeApp;
use crate::command::{BulkCommandRequest, CommandRequest};
use crate::observability::{system_health, uptime_human};
use crate::pool::PoolDeviceStatus;
use crate::stream::formatter::now_iso;
use crate::stream::StreamManager;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use warp::http::{Method, StatusCode};
use warp::path::FullPath;
use warp::reply::Response;
use warp::Reply;

/// Delay between answering `POST /shutdown` and triggering the shutdown
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

type HandlerResult = Result<Response, Infallible>;

fn json_reply(body: &Value) -> HandlerResult {
    Ok(warp::reply::json(body).into_response())
}

fn validation_failed(issues: Vec<String>) -> Response {
    let details = Value::from(
        issues
            .iter()
            .map(|issue| json!({"message": issue}))
            .collect::<Vec<_>>(),
    );
    error_reply(
        400,
        format!("Validation failed: {}", issues.join(", ")),
        Some(details),
    )
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, Response> {
    serde_json::from_slice(body).map_err(|e| validation_failed(vec![e.to_string()]))
}

/// Field-level checks applied before a command reaches the handler
fn command_schema_issues(command: &CommandRequest, prefix: &str) -> Vec<String> {
    let mut issues = Vec::new();
    for (field, value) in [
        ("device_id", &command.device_id),
        ("topic", &command.topic),
        ("state", &command.state),
    ] {
        if value.is_empty() {
            issues.push(format!("{prefix}{field} must not be empty"));
        }
    }
    if command.qos > 2 {
        issues.push(format!("{prefix}qos must be between 0 and 2"));
    }
    issues
}

fn stream_or_404<'a>(app: &'a BridgeApp, device_id: &str) -> Result<&'a Arc<StreamManager>, Response> {
    app.stream(device_id).map_err(|e| bridge_error_reply(&e))
}

fn device_entries(app: &BridgeApp) -> Map<String, Value> {
    let stats = app.pool().get_stats();
    app.pool()
        .get_device_ids()
        .into_iter()
        .map(|id| {
            let entry = json!({
                "mqtt": stats.devices.get(&id),
                "stream": app.streams().get(&id).map(|s| s.get_stats()),
            });
            (id, entry)
        })
        .collect()
}

pub async fn root() -> HandlerResult {
    json_reply(&json!({
        "service": "Telemetry Bridge",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "uptime": uptime_human(),
        "timestamp": now_iso(),
    }))
}

pub async fn health(app: Arc<BridgeApp>) -> HandlerResult {
    let stats = app.pool().get_stats();
    let healthy = stats.connected_connections == stats.total_connections;
    let streaming = app
        .streams()
        .values()
        .any(|s| s.get_status() == crate::stream::StreamStatus::Running);

    let body = json!({
        "healthy": healthy,
        "services": {
            "mqtt": stats.connected_connections > 0,
            "stream": streaming,
            "api": true,
        },
        "mqtt_connections": stats,
        "system": system_health(),
        "timestamp": now_iso(),
    });
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(warp::reply::with_status(warp::reply::json(&body), status).into_response())
}

pub async fn status(app: Arc<BridgeApp>) -> HandlerResult {
    let stats = app.pool().get_stats();
    json_reply(&json!({
        "service": {
            "uptime": uptime_human(),
            "devices": stats.total_devices,
            "timestamp": now_iso(),
        },
        "mqtt_connections": stats,
        "devices": device_entries(&app),
        "processing": {
            "total_messages": app.metrics().total_messages(),
            "avg_processing_time_ms": app.metrics().average_processing_time().as_secs_f64() * 1000.0,
        },
        "system": system_health(),
    }))
}

pub async fn all_stats(app: Arc<BridgeApp>) -> HandlerResult {
    let devices = device_entries(&app);
    json_reply(&json!({
        "service": {
            "uptime": uptime_human(),
            "devices": devices.len(),
            "timestamp": now_iso(),
        },
        "devices": devices,
    }))
}

pub async fn device_stats(device_id: String, app: Arc<BridgeApp>) -> HandlerResult {
    let stats = app.pool().get_stats();
    match (stats.devices.get(&device_id), app.streams().get(&device_id)) {
        (Some(mqtt), Some(stream)) => json_reply(&json!({
            "device_id": device_id,
            "mqtt": mqtt,
            "stream": stream.get_stats(),
            "timestamp": now_iso(),
        })),
        _ => Ok(not_found(format!("Device {device_id} not found"))),
    }
}

pub async fn mqtt_summary(app: Arc<BridgeApp>) -> HandlerResult {
    let stats = app.pool().get_stats();
    json_reply(&json!({
        "summary": {
            "totalDevices": stats.total_devices,
            "totalConnections": stats.total_connections,
            "connectedConnections": stats.connected_connections,
            "devicesReady": stats.devices_ready,
            "totalTopicsDiscovered": stats.total_topics_discovered,
            "totalMessagesReceived": stats.total_messages_received,
        },
        "devices": stats.devices,
        "timestamp": now_iso(),
    }))
}

pub async fn stream_summary(app: Arc<BridgeApp>) -> HandlerResult {
    let devices: Map<String, Value> = app
        .streams()
        .iter()
        .map(|(id, stream)| (id.clone(), json!(stream.get_stats())))
        .collect();
    json_reply(&json!({"devices": devices, "timestamp": now_iso()}))
}

pub async fn topics(app: Arc<BridgeApp>) -> HandlerResult {
    let stats = app.pool().get_stats();
    let devices: Map<String, Value> = stats
        .devices
        .iter()
        .map(|(id, d)| {
            let entry = json!({
                "topics_discovered": d.topics_discovered,
                "topics_subscribed": d.topics_subscribed,
                "status": d.status,
            });
            (id.clone(), entry)
        })
        .collect();
    json_reply(&json!({"devices": devices, "timestamp": now_iso()}))
}

pub async fn device_topics(device_id: String, app: Arc<BridgeApp>) -> HandlerResult {
    let stats = app.pool().get_stats();
    let Some(device) = stats.devices.get(&device_id) else {
        return Ok(not_found(format!("Device {device_id} not found")));
    };
    json_reply(&json!({
        "device_id": device_id,
        "thing_name": device.thing_name,
        "topics_discovered": device.topics_discovered,
        "topics_subscribed": device.topics_subscribed,
        "status": device.status,
        "timestamp": now_iso(),
    }))
}

/// Stream control actions exposed under `/control`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamAction {
    Pause,
    Resume,
    Stop,
}

pub async fn control_stream(
    action: StreamAction,
    device_id: String,
    app: Arc<BridgeApp>,
) -> HandlerResult {
    let stream = match stream_or_404(&app, &device_id) {
        Ok(stream) => stream,
        Err(response) => return Ok(response),
    };

    let verb = match action {
        StreamAction::Pause => {
            stream.pause();
            "paused"
        }
        StreamAction::Resume => {
            stream.resume();
            "resumed"
        }
        StreamAction::Stop => {
            stream.stop();
            "stopped"
        }
    };
    json_reply(&json!({
        "message": format!("Streaming {verb} for device {device_id}"),
        "device_id": device_id,
        "timestamp": now_iso(),
    }))
}

pub async fn clear_queue(device_id: String, app: Arc<BridgeApp>) -> HandlerResult {
    let stream = match stream_or_404(&app, &device_id) {
        Ok(stream) => stream,
        Err(response) => return Ok(response),
    };
    let removed = stream.clear_queue();
    json_reply(&json!({
        "message": format!("Queue cleared for device {device_id}"),
        "device_id": device_id,
        "removed_messages": removed,
        "timestamp": now_iso(),
    }))
}

fn control_entry(app: &BridgeApp, device_id: &str) -> Option<Value> {
    let stats = app.pool().get_stats();
    let device = stats.devices.get(device_id)?;
    let stream = app.streams().get(device_id)?;
    Some(json!({
        "mqtt_connected": device.status == PoolDeviceStatus::Ready,
        "mqtt_connections": device.connections,
        "stream_status": stream.get_status(),
        "queue_size": stream.get_queue_size(),
    }))
}

pub async fn control_status(app: Arc<BridgeApp>) -> HandlerResult {
    let devices: Map<String, Value> = app
        .pool()
        .get_device_ids()
        .into_iter()
        .filter_map(|id| control_entry(&app, &id).map(|entry| (id, entry)))
        .collect();
    json_reply(&json!({"devices": devices, "timestamp": now_iso()}))
}

pub async fn device_control_status(device_id: String, app: Arc<BridgeApp>) -> HandlerResult {
    let Some(Value::Object(mut entry)) = control_entry(&app, &device_id) else {
        return Ok(not_found(format!("Device {device_id} not found")));
    };
    let mut body = Map::new();
    body.insert("device_id".to_string(), Value::from(device_id));
    body.append(&mut entry);
    body.insert("timestamp".to_string(), Value::from(now_iso()));
    json_reply(&Value::Object(body))
}

async fn run_command(app: &BridgeApp, request: CommandRequest) -> HandlerResult {
    let issues = command_schema_issues(&request, "");
    if !issues.is_empty() {
        return Ok(validation_failed(issues));
    }
    let commands = app.commands();
    if let Err(e) = commands.validate_request(&request) {
        return Ok(bridge_error_reply(&e));
    }
    match commands.process_command(&request).await {
        Ok(response) => json_reply(&json!(response)),
        Err(e) => Ok(bridge_error_reply(&e)),
    }
}

pub async fn send_command(body: Bytes, app: Arc<BridgeApp>) -> HandlerResult {
    match parse_body::<CommandRequest>(&body) {
        Ok(request) => run_command(&app, request).await,
        Err(response) => Ok(response),
    }
}

/// `POST /command/:deviceId`; the path id wins over any `device_id` in the body
pub async fn send_device_command(device_id: String, body: Bytes, app: Arc<BridgeApp>) -> HandlerResult {
    let mut fields = match parse_body::<Value>(&body) {
        Ok(Value::Object(fields)) => fields,
        Ok(_) => return Ok(validation_failed(vec!["body must be a JSON object".to_string()])),
        Err(response) => return Ok(response),
    };
    fields.insert("device_id".to_string(), Value::from(device_id));

    match serde_json::from_value::<CommandRequest>(Value::Object(fields)) {
        Ok(request) => run_command(&app, request).await,
        Err(e) => Ok(validation_failed(vec![e.to_string()])),
    }
}

pub async fn send_bulk_command(body: Bytes, app: Arc<BridgeApp>) -> HandlerResult {
    let request = match parse_body::<BulkCommandRequest>(&body) {
        Ok(request) => request,
        Err(response) => return Ok(response),
    };

    let mut issues = Vec::new();
    if request.commands.is_empty() {
        issues.push("commands must contain at least 1 item".to_string());
    }
    for (index, command) in request.commands.iter().enumerate() {
        issues.extend(command_schema_issues(command, &format!("commands.{index}.")));
    }
    if !issues.is_empty() {
        return Ok(validation_failed(issues));
    }

    let response = app.commands().process_bulk_command(&request).await;
    json_reply(&json!(response))
}

pub async fn command_history(device_id: String) -> HandlerResult {
    json_reply(&json!({
        "device_id": device_id,
        "commands": [],
        "message": "Command history not implemented yet",
        "timestamp": now_iso(),
    }))
}

pub async fn health_summary(app: Arc<BridgeApp>) -> HandlerResult {
    let summary = app.pool().get_health_summary();
    let mut body = match serde_json::to_value(&summary) {
        Ok(Value::Object(body)) => body,
        _ => Map::new(),
    };
    body.insert("timestamp".to_string(), Value::from(now_iso()));
    json_reply(&Value::Object(body))
}

pub async fn device_health(device_id: String, app: Arc<BridgeApp>) -> HandlerResult {
    match app.pool().get_device_health(&device_id) {
        Some(health) => json_reply(&json!({
            "device_id": device_id,
            "health": health,
            "timestamp": now_iso(),
        })),
        None => Ok(not_found(format!(
            "Device {device_id} not found in health monitor"
        ))),
    }
}

pub async fn retry_device(device_id: String, app: Arc<BridgeApp>) -> HandlerResult {
    match app.pool().force_device_retry(&device_id).await {
        Ok(()) => json_reply(&json!({
            "success": true,
            "message": format!("Retry initiated for device {device_id}"),
            "timestamp": now_iso(),
        })),
        Err(e) => Ok(error_reply(
            500,
            format!("Failed to retry device {device_id}: {}", e.public_message()),
            None,
        )),
    }
}

pub async fn all_device_health(app: Arc<BridgeApp>) -> HandlerResult {
    let devices: Vec<_> = app.pool().get_all_device_health().into_values().collect();
    json_reply(&json!({
        "devices": devices,
        "total": devices.len(),
        "timestamp": now_iso(),
    }))
}

pub async fn shutdown(app: Arc<BridgeApp>) -> HandlerResult {
    info!("Shutdown requested via API");
    tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        app.request_shutdown();
    });

    let body = json!({
        "message": "Shutdown initiated. Server will restart to load new configuration.",
        "timestamp": now_iso(),
    });
    Ok(warp::reply::with_status(warp::reply::json(&body), StatusCode::ACCEPTED).into_response())
}

pub async fn route_not_found(method: Method, path: FullPath) -> HandlerResult {
    Ok(not_found(format!(
        "Route {method} {} not found",
        path.as_str()
    )))
}
