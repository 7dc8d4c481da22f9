//! Topic discovery payload parsing and per-device discovery state

use serde_json::Value;

/// Topics a device announced on `<thing_name>/topics`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicDiscovery {
    pub thing_name: String,
    pub topics: Vec<String>,
    /// Set once; later announcements are ignored
    pub complete: bool,
}

impl TopicDiscovery {
    pub fn new(thing_name: &str) -> Self {
        Self {
            thing_name: thing_name.to_string(),
            topics: Vec::new(),
            complete: false,
        }
    }

    /// Record the first non-empty announcement. Returns true if it was accepted.
    pub fn record(&mut self, topics: Vec<String>) -> bool {
        if self.complete || topics.is_empty() {
            return false;
        }
        self.topics = topics;
        self.complete = true;
        true
    }
}

fn strings(items: &[Value]) -> impl Iterator<Item = String> + '_ {
    items.iter().filter_map(|v| v.as_str().map(str::to_string))
}

/// Extract topic names from a discovery announcement.
///
/// Accepted shapes, in order of precedence:
/// - `["a", "b"]`
/// - `{"x": ["a"], "y": ["b"]}`, concatenated in key order
/// - `{"topics": ["a", "b"]}`
/// - any other object: its keys
///
/// Scalars yield no topics; malformed JSON is an error.
pub fn parse_discovery_payload(payload: &str) -> Result<Vec<String>, serde_json::Error> {
    let value: Value = serde_json::from_str(payload)?;

    let topics = match &value {
        Value::Array(items) => strings(items).collect(),
        Value::Object(fields) => {
            if fields.values().any(Value::is_array) {
                fields
                    .values()
                    .filter_map(Value::as_array)
                    .flat_map(|items| strings(items))
                    .collect()
            } else if let Some(Value::Array(items)) = fields.get("topics") {
                strings(items).collect()
            } else {
                fields.keys().cloned().collect()
            }
        }
        _ => Vec::new(),
    };

    Ok(topics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_array() {
        assert_eq!(parse_discovery_payload(r#"["a","b"]"#).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_flat_array_skips_non_strings() {
        assert_eq!(
            parse_discovery_payload(r#"["a", 1, null, "b"]"#).unwrap(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_object_of_arrays_in_key_order() {
        assert_eq!(
            parse_discovery_payload(r#"{"x":["p"],"y":["q"]}"#).unwrap(),
            vec!["p", "q"]
        );
        assert_eq!(
            parse_discovery_payload(r#"{"y":["q"],"x":["p"],"meta":"v1"}"#).unwrap(),
            vec!["q", "p"]
        );
    }

    #[test]
    fn test_topics_field() {
        assert_eq!(
            parse_discovery_payload(r#"{"topics":["p","q"]}"#).unwrap(),
            vec!["p", "q"]
        );
    }

    #[test]
    fn test_object_keys_fallback() {
        assert_eq!(
            parse_discovery_payload(r#"{"temp": 1, "humidity": {"unit": "%"}}"#).unwrap(),
            vec!["temp", "humidity"]
        );
    }

    #[test]
    fn test_scalars_yield_nothing() {
        assert!(parse_discovery_payload("42").unwrap().is_empty());
        assert!(parse_discovery_payload(r#""a""#).unwrap().is_empty());
        assert!(parse_discovery_payload("null").unwrap().is_empty());
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(parse_discovery_payload("{not json").is_err());
    }

    #[test]
    fn test_discovery_is_written_once() {
        let mut discovery = TopicDiscovery::new("thing-1");
        assert!(!discovery.record(Vec::new()));
        assert!(!discovery.complete);

        assert!(discovery.record(vec!["a".to_string()]));
        assert!(!discovery.record(vec!["b".to_string()]));
        assert_eq!(discovery.topics, vec!["a"]);
    }
}
