//! Normalization of raw MQTT payloads into the outbound batch schema

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static INTEGER: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+$").expect("static regex is valid"));
static DECIMAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-?\d*\.\d+$").expect("static regex is valid"));
static EXPONENTIAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^-?\d*\.?\d+e[+-]?\d+$").expect("static regex is valid"));

/// Fields probed, in order, for the measured value of an object payload
const VALUE_FIELDS: [&str; 4] = ["value", "data", "payload", "val"];

const DEFAULT_VALUE_TYPE: &str = "IoTValue";

/// A raw message waiting in a device queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub topic: String,
    pub timestamp: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    #[serde(rename = "type")]
    pub value_type: Value,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedTopicData {
    pub topic: String,
    pub timestamp: String,
    pub data: TypedValue,
}

/// Body POSTed to the ingestion sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamBatchPayload {
    pub timestamp: String,
    pub platform_device_id: String,
    pub routine_id: String,
    pub data: Vec<ProcessedTopicData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Current time as ISO-8601 with millisecond precision
pub fn now_iso() -> String {
    to_iso(Utc::now())
}

fn to_iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Coerce a timestamp string to ISO-8601, falling back to now
pub fn format_timestamp(timestamp: Option<&str>) -> String {
    let Some(raw) = timestamp.map(str::trim).filter(|s| !s.is_empty()) else {
        return now_iso();
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return to_iso(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(raw) {
        return to_iso(parsed.with_timezone(&Utc));
    }
    for pattern in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, pattern) {
            return to_iso(naive.and_utc());
        }
    }
    if let Some(midnight) = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
    {
        return to_iso(midnight.and_utc());
    }

    tracing::debug!(timestamp = raw, "Unparseable timestamp, using current time");
    now_iso()
}

/// Turn numeric strings into JSON numbers; everything else passes through
pub fn convert_to_number(value: &Value) -> Value {
    let Value::String(text) = value else {
        return value.clone();
    };
    let trimmed = text.trim();

    if INTEGER.is_match(trimmed) {
        if let Ok(n) = trimmed.parse::<i64>() {
            return Value::from(n);
        }
        return float_or_original(trimmed, value);
    }
    if DECIMAL.is_match(trimmed) || EXPONENTIAL.is_match(trimmed) {
        return float_or_original(trimmed, value);
    }

    value.clone()
}

fn float_or_original(text: &str, original: &Value) -> Value {
    text.parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| original.clone())
}

/// Pull the measured value out of a parsed payload
pub fn extract_value(raw: &Value) -> Value {
    match raw {
        Value::Null => Value::from(0),
        Value::Object(fields) => VALUE_FIELDS
            .iter()
            .find_map(|name| fields.get(*name))
            .map(convert_to_number)
            .unwrap_or_else(|| raw.clone()),
        Value::Array(_) => raw.clone(),
        other => convert_to_number(other),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

pub fn format_topic_data(topic: &str, raw: &Value, timestamp: Option<&str>) -> ProcessedTopicData {
    let value_type = raw
        .get("type")
        .filter(|t| is_truthy(t))
        .cloned()
        .unwrap_or_else(|| Value::from(DEFAULT_VALUE_TYPE));

    ProcessedTopicData {
        topic: topic.to_string(),
        timestamp: format_timestamp(timestamp),
        data: TypedValue {
            value_type,
            data: extract_value(raw),
        },
    }
}

pub fn format_batch(
    device_id: &str,
    routine_id: &str,
    messages: &[QueuedMessage],
    metadata: Option<&Map<String, Value>>,
) -> StreamBatchPayload {
    StreamBatchPayload {
        timestamp: now_iso(),
        platform_device_id: device_id.to_string(),
        routine_id: routine_id.to_string(),
        data: messages
            .iter()
            .map(|m| format_topic_data(&m.topic, &m.data, Some(&m.timestamp)))
            .collect(),
        metadata: metadata.cloned(),
    }
}

/// One-line description of a batch for logs
pub fn summarize_payload(payload: &StreamBatchPayload) -> String {
    let topics: Vec<&str> = payload
        .data
        .iter()
        .take(3)
        .map(|d| d.topic.as_str())
        .collect();
    let ellipsis = if payload.data.len() > 3 { "..." } else { "" };
    let metadata = payload
        .metadata
        .as_ref()
        .map(|m| {
            let keys: Vec<&str> = m.keys().map(String::as_str).collect();
            format!(" with metadata: {}", keys.join(", "))
        })
        .unwrap_or_default();

    format!(
        "Payload with {} messages for device {}{}. Topics: {}{}",
        payload.data.len(),
        payload.platform_device_id,
        metadata,
        topics.join(", "),
        ellipsis
    )
}
