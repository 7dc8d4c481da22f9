//! Command requests translated into device control-plane publishes
//!
//! | request topic   | published to      | payload                                   |
//! |-----------------|-------------------|-------------------------------------------|
//! | `x/state`       | `<thing>/sub`     | `{type:"CMD", topic_names:["x/command"], states:[state], ..params}` |
//! | `x/command`     | `<thing>/x/command` | `state`, or `{state, ..params}` with params |
//! | anything else   | `<thing>/sub`     | CMD envelope for `<topic>/command`         |

use crate::error::{BridgeError, BridgeResult};
use crate::pool::{ConnectionPoolManager, PoolDeviceStatus};
use crate::stream::formatter::now_iso;
use crate::transport::mqtt::TopicBuilder;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

fn default_qos() -> u8 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_params: Option<Map<String, Value>>,
    /// Accepted for compatibility; publishes always go out at QoS 1
    #[serde(default = "default_qos")]
    pub qos: u8,
}

impl CommandRequest {
    pub fn new(device_id: &str, topic: &str, state: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            topic: topic.to_string(),
            state: state.to_string(),
            topic_type: None,
            additional_params: None,
            qos: default_qos(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    StateToCommand,
    DirectCommand,
    CustomTopic,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandResponse {
    pub message: String,
    pub device_id: String,
    pub state: String,
    /// Full broker topic the command was published to
    pub topic: String,
    pub command_type: CommandType,
    pub timestamp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkCommandRequest {
    #[serde(default)]
    pub commands: Vec<CommandRequest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BulkStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkCommandResult {
    pub device_id: String,
    pub status: BulkStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_type: Option<CommandType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkCommandResponse {
    pub summary: BulkSummary,
    pub results: Vec<BulkCommandResult>,
    pub timestamp: String,
}

/// Broker topic and payload a request resolves to
#[derive(Debug, Clone, PartialEq)]
pub struct CommandPlan {
    pub target_topic: String,
    pub payload: String,
    pub command_type: CommandType,
}

fn cmd_envelope(command_topic: String, state: &str, params: Option<&Map<String, Value>>) -> String {
    let mut envelope = Map::new();
    envelope.insert("type".to_string(), Value::from("CMD"));
    envelope.insert("topic_names".to_string(), Value::from(vec![command_topic]));
    envelope.insert("states".to_string(), Value::from(vec![state.to_string()]));
    if let Some(params) = params {
        envelope.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Value::Object(envelope).to_string()
}

/// Resolve where and what to publish for a request
pub fn plan_command(thing_name: &str, request: &CommandRequest) -> CommandPlan {
    let params = request.additional_params.as_ref();
    let topic = request.topic.as_str();

    if let Some(base) = topic.strip_suffix("/state") {
        CommandPlan {
            target_topic: TopicBuilder::sub(thing_name),
            payload: cmd_envelope(format!("{base}/command"), &request.state, params),
            command_type: CommandType::StateToCommand,
        }
    } else if topic.ends_with("/command") {
        let payload = match params {
            Some(params) => {
                let mut body = Map::new();
                body.insert("state".to_string(), Value::from(request.state.clone()));
                body.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
                Value::Object(body).to_string()
            }
            None => request.state.clone(),
        };
        CommandPlan {
            target_topic: TopicBuilder::device_topic(thing_name, topic),
            payload,
            command_type: CommandType::DirectCommand,
        }
    } else {
        CommandPlan {
            target_topic: TopicBuilder::sub(thing_name),
            payload: cmd_envelope(format!("{topic}/command"), &request.state, params),
            command_type: CommandType::CustomTopic,
        }
    }
}

pub struct CommandHandler {
    pool: Arc<ConnectionPoolManager>,
}

impl CommandHandler {
    pub fn new(pool: Arc<ConnectionPoolManager>) -> Self {
        Self { pool }
    }

    /// Check required fields and that the device is configured
    pub fn validate_request(&self, request: &CommandRequest) -> BridgeResult<()> {
        if request.device_id.is_empty() {
            return Err(BridgeError::validation("device_id is required"));
        }
        if request.topic.is_empty() {
            return Err(BridgeError::validation("topic is required"));
        }
        if request.state.is_empty() {
            return Err(BridgeError::validation("state is required"));
        }
        if request.qos > 2 {
            return Err(BridgeError::validation("qos must be between 0 and 2"));
        }
        if self.pool.get_device_config(&request.device_id).is_none() {
            return Err(BridgeError::validation(format!(
                "Device {} not found in configuration",
                request.device_id
            )));
        }
        Ok(())
    }

    pub async fn process_command(&self, request: &CommandRequest) -> BridgeResult<CommandResponse> {
        let device_id = request.device_id.as_str();
        info!(device_id, topic = %request.topic, state = %request.state, "Processing command");

        let config = self
            .pool
            .get_device_config(device_id)
            .ok_or_else(|| BridgeError::device_not_found(device_id))?;

        let ready = self
            .pool
            .get_stats()
            .devices
            .get(device_id)
            .map(|d| d.status == PoolDeviceStatus::Ready)
            .unwrap_or(false);
        if !ready {
            return Err(BridgeError::device_not_ready(device_id));
        }

        let plan = plan_command(&config.thing_name, request);
        debug!(
            device_id,
            target_topic = %plan.target_topic,
            command_type = ?plan.command_type,
            payload = %plan.payload,
            "Command prepared"
        );

        let local_topic = TopicBuilder::strip_thing_prefix(&config.thing_name, &plan.target_topic);
        if let Err(e) = self
            .pool
            .publish(device_id, local_topic, plan.payload.clone().into_bytes())
            .await
        {
            error!(device_id, topic = %request.topic, error = %e, "Failed to send command");
            return Err(BridgeError::command(e.to_string()));
        }

        info!(
            device_id,
            target_topic = %plan.target_topic,
            command_type = ?plan.command_type,
            "Command sent successfully"
        );
        Ok(CommandResponse {
            message: "Command sent successfully".to_string(),
            device_id: device_id.to_string(),
            state: request.state.clone(),
            topic: plan.target_topic,
            command_type: plan.command_type,
            timestamp: now_iso(),
        })
    }

    /// Run every command concurrently; one failure never affects the others
    pub async fn process_bulk_command(&self, request: &BulkCommandRequest) -> BulkCommandResponse {
        let started = Instant::now();
        info!(command_count = request.commands.len(), "Processing bulk command");

        let results = join_all(request.commands.iter().map(|command| async move {
            let outcome = match self.validate_request(command) {
                Ok(()) => self.process_command(command).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(response) => BulkCommandResult {
                    device_id: command.device_id.clone(),
                    status: BulkStatus::Success,
                    message: response.message,
                    command_type: Some(response.command_type),
                    error: None,
                },
                Err(e) => {
                    error!(device_id = %command.device_id, error = %e, "Bulk command failed for device");
                    BulkCommandResult {
                        device_id: command.device_id.clone(),
                        status: BulkStatus::Error,
                        message: "Command failed".to_string(),
                        command_type: None,
                        error: Some(e.to_string()),
                    }
                }
            }
        }))
        .await;

        let successful = results
            .iter()
            .filter(|r| r.status == BulkStatus::Success)
            .count();
        let summary = BulkSummary {
            total: request.commands.len(),
            successful,
            failed: results.len() - successful,
            execution_time_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            total = summary.total,
            successful = summary.successful,
            failed = summary.failed,
            execution_time_ms = summary.execution_time_ms,
            "Bulk command completed"
        );

        BulkCommandResponse {
            summary,
            results,
            timestamp: now_iso(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parsed(payload: &str) -> Value {
        serde_json::from_str(payload).unwrap()
    }

    #[test]
    fn test_state_topic_becomes_cmd_envelope() {
        let plan = plan_command("thing-1", &CommandRequest::new("dev-1", "light/state", "ON"));
        assert_eq!(plan.target_topic, "thing-1/sub");
        assert_eq!(plan.command_type, CommandType::StateToCommand);
        assert_eq!(
            parsed(&plan.payload),
            json!({"type": "CMD", "topic_names": ["light/command"], "states": ["ON"]})
        );
    }

    #[test]
    fn test_state_suffix_rewritten_only_at_end() {
        let plan = plan_command("thing-1", &CommandRequest::new("dev-1", "a/state/b/state", "1"));
        assert_eq!(parsed(&plan.payload)["topic_names"], json!(["a/state/b/command"]));
    }

    #[test]
    fn test_command_topic_published_directly() {
        let request = CommandRequest::new("dev-1", "pump/command", "OFF");
        let plan = plan_command("thing-1", &request);
        assert_eq!(plan.target_topic, "thing-1/pump/command");
        assert_eq!(plan.payload, "OFF");
        assert_eq!(plan.command_type, CommandType::DirectCommand);

        let mut params = Map::new();
        params.insert("level".to_string(), json!(3));
        let request = CommandRequest {
            additional_params: Some(params),
            ..request
        };
        let plan = plan_command("thing-1", &request);
        assert_eq!(parsed(&plan.payload), json!({"state": "OFF", "level": 3}));
    }

    #[test]
    fn test_bare_topic_gets_command_suffix() {
        let mut params = Map::new();
        params.insert("states".to_string(), json!(["override"]));
        params.insert("source".to_string(), json!("api"));
        let request = CommandRequest {
            additional_params: Some(params),
            ..CommandRequest::new("dev-1", "fan", "HIGH")
        };

        let plan = plan_command("thing-1", &request);
        assert_eq!(plan.target_topic, "thing-1/sub");
        assert_eq!(plan.command_type, CommandType::CustomTopic);
        let payload = parsed(&plan.payload);
        assert_eq!(payload["topic_names"], json!(["fan/command"]));
        assert_eq!(payload["states"], json!(["override"]));
        assert_eq!(payload["source"], "api");
    }

    #[test]
    fn test_request_defaults_when_deserialized() {
        let request: CommandRequest =
            serde_json::from_value(json!({"device_id": "d", "topic": "t", "state": "s"})).unwrap();
        assert_eq!(request.qos, 1);
        assert!(request.additional_params.is_none());

        let missing: CommandRequest = serde_json::from_value(json!({"topic": "t"})).unwrap();
        assert!(missing.device_id.is_empty());
    }

    #[test]
    fn test_command_type_wire_names() {
        assert_eq!(json!(CommandType::StateToCommand), json!("state_to_command"));
        assert_eq!(json!(CommandType::DirectCommand), json!("direct_command"));
        assert_eq!(json!(CommandType::CustomTopic), json!("custom_topic"));
    }
}
