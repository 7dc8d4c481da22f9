//! Configuration for the telemetry bridge
//!
//! The bridge core only consumes a validated [`BridgeConfig`]. This module
//! provides the TOML loader and the validation rules applied at startup; any
//! failure here is a fatal configuration error.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Minimum batch interval accepted for a stream, in milliseconds
pub const MIN_STREAM_RATE_MS: u64 = 100;

/// Complete bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    pub mqtt: MqttSection,
    pub stream: StreamSection,
    pub devices: Vec<DeviceConfig>,
    pub certs: Option<CertificatePaths>,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub bridge: BridgeSection,
}

/// Broker endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker host name (no scheme)
    pub endpoint: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Use TLS with the configured certificates
    #[serde(default = "default_true")]
    pub tls: bool,
}

fn default_mqtt_port() -> u16 {
    8883
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamSection {
    pub parameters: StreamParameters,
}

/// Ingestion sink parameters shared by every device stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamParameters {
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub streaming: StreamingSettings,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Batch interval in milliseconds
    #[serde(default = "default_stream_rate")]
    pub rate: u64,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rate: default_stream_rate(),
        }
    }
}

fn default_stream_rate() -> u64 {
    5000
}

/// How a device's inbound topics are admitted into its stream
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    All,
    Selected,
    DataAll,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicSubscription {
    pub mode: SubscriptionMode,
    #[serde(default)]
    pub list: Vec<String>,
    /// Topic categories for `data_all` mode; carried for operators, not used for filtering
    pub categories: Option<Vec<String>>,
}

/// One physical device bridged through the broker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    pub device_id: String,
    pub stack_name: String,
    /// Broker-side identity, used as the topic namespace prefix
    pub thing_name: String,
    pub topics: TopicSubscription,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    /// Overrides `stream.parameters.streaming.rate` for this device
    pub stream_rate_ms: Option<u64>,
}

/// TLS material used for every broker connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CertificatePaths {
    pub root_ca: PathBuf,
    pub cert: PathBuf,
    pub private_key: PathBuf,
}

impl CertificatePaths {
    /// Resolve certificate paths from `CERTS_DIR`, `ROOT_CA`, `CERT` and `PRIVATE_KEY`
    pub fn from_env() -> Self {
        let dir = PathBuf::from(env_or("CERTS_DIR", "./certs"));
        Self {
            root_ca: dir.join(env_or("ROOT_CA", "AmazonRootCA1.pem")),
            cert: dir.join(env_or("CERT", "thing.cert.pem")),
            private_key: dir.join(env_or("PRIVATE_KEY", "thing.private.key")),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("root_ca", &self.root_ca),
            ("cert", &self.cert),
            ("private_key", &self.private_key),
        ] {
            if !path.exists() {
                return Err(ConfigError::CertificateNotFound {
                    name: name.to_string(),
                    path: path.display().to_string(),
                });
            }
        }
        Ok(())
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

/// HTTP control surface
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_server_port(),
        }
    }
}

fn default_server_port() -> u16 {
    8000
}

/// Device health monitor tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    /// None retries forever
    pub max_retries: Option<u32>,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            initial_retry_delay_ms: default_initial_retry_delay(),
            max_retry_delay_ms: default_max_retry_delay(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            max_retries: None,
            health_check_interval_ms: default_health_check_interval(),
        }
    }
}

fn default_initial_retry_delay() -> u64 {
    5000
}

fn default_max_retry_delay() -> u64 {
    300_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_health_check_interval() -> u64 {
    30_000
}

/// Composition-root settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSection {
    /// Delay between pool initialization and accepting telemetry
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown(),
        }
    }
}

fn default_cooldown() -> u64 {
    10
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Certificate file not found: {path} ({name})")]
    CertificateNotFound { name: String, path: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BridgeConfig {
    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse, apply environment overrides and validate
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: BridgeConfig = toml::from_str(content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(port) = std::env::var("PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::InvalidConfig(format!("PORT '{port}' is not a port")))?;
        }

        if self.certs.is_none() && self.mqtt.tls {
            self.certs = Some(CertificatePaths::from_env());
        }

        Ok(())
    }

    /// Validate the configuration; warnings are logged, violations are errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.endpoint.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "mqtt.endpoint is required".to_string(),
            ));
        }
        if self.mqtt.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "mqtt.port must be between 1 and 65535".to_string(),
            ));
        }

        let endpoint = &self.stream.parameters.endpoint;
        let parsed = url::Url::parse(endpoint).map_err(|_| {
            ConfigError::InvalidConfig(format!("stream endpoint '{endpoint}' is not a valid URL"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidConfig(format!(
                "stream endpoint '{endpoint}' must be http or https"
            )));
        }

        if self.stream.parameters.streaming.rate < MIN_STREAM_RATE_MS {
            return Err(ConfigError::InvalidConfig(format!(
                "stream rate must be at least {MIN_STREAM_RATE_MS}ms"
            )));
        }

        if self.devices.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one device must be configured".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for device in &self.devices {
            validate_device(device)?;
            if !seen.insert(device.device_id.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate device_id '{}'",
                    device.device_id
                )));
            }
        }

        if self.mqtt.tls {
            match &self.certs {
                Some(certs) => certs.validate()?,
                None => {
                    return Err(ConfigError::InvalidConfig(
                        "TLS is enabled but no certificates are configured".to_string(),
                    ))
                }
            }
        }

        Ok(())
    }

    /// Batch interval for a device, honoring its override
    pub fn stream_rate_for(&self, device: &DeviceConfig) -> u64 {
        device
            .stream_rate_ms
            .unwrap_or(self.stream.parameters.streaming.rate)
            .max(MIN_STREAM_RATE_MS)
    }
}

fn validate_device(device: &DeviceConfig) -> Result<(), ConfigError> {
    for (field, value) in [
        ("device_id", &device.device_id),
        ("stack_name", &device.stack_name),
        ("thing_name", &device.thing_name),
    ] {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(format!(
                "device '{}' is missing {field}",
                device.device_id
            )));
        }
    }

    if let Some(rate) = device.stream_rate_ms {
        if rate < MIN_STREAM_RATE_MS {
            return Err(ConfigError::InvalidConfig(format!(
                "device '{}' stream_rate_ms must be at least {MIN_STREAM_RATE_MS}ms",
                device.device_id
            )));
        }
    }

    if device.topics.mode == SubscriptionMode::Selected && device.topics.list.is_empty() {
        warn!(
            device_id = %device.device_id,
            "Device has selected mode but no topics listed"
        );
    }

    Ok(())
}

impl DeviceConfig {
    /// Minimal device definition, mostly useful in tests and tooling
    pub fn new(device_id: &str, thing_name: &str, mode: SubscriptionMode) -> Self {
        Self {
            device_id: device_id.to_string(),
            stack_name: format!("{device_id}-stack"),
            thing_name: thing_name.to_string(),
            topics: TopicSubscription {
                mode,
                list: Vec::new(),
                categories: None,
            },
            metadata: None,
            stream_rate_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[mqtt]
endpoint = "broker.example.com"
tls = false

[stream.parameters]
endpoint = "https://ingest.example.com/batches"

[[devices]]
device_id = "dev-1"
stack_name = "stack-1"
thing_name = "thing-1"
topics = { mode = "all" }
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = BridgeConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.mqtt.port, 8883);
        assert_eq!(config.stream.parameters.method, "POST");
        assert!(config.stream.parameters.headers.is_empty());
        assert!(config.stream.parameters.streaming.enabled);
        assert_eq!(config.stream.parameters.streaming.rate, 5000);
        assert_eq!(config.health, HealthSection::default());
        assert_eq!(config.bridge.cooldown_secs, 10);
        assert_eq!(config.devices[0].topics.mode, SubscriptionMode::All);
    }

    #[test]
    fn test_subscription_modes_parse() {
        let toml_content = MINIMAL.replace(
            r#"topics = { mode = "all" }"#,
            r#"topics = { mode = "data_all", list = [], categories = ["env"] }"#,
        );
        let config = BridgeConfig::from_toml_str(&toml_content).unwrap();
        assert_eq!(config.devices[0].topics.mode, SubscriptionMode::DataAll);
        assert_eq!(
            config.devices[0].topics.categories,
            Some(vec!["env".to_string()])
        );
    }

    #[test]
    fn test_rate_below_minimum_is_rejected() {
        let toml_content = MINIMAL.replace(
            "endpoint = \"https://ingest.example.com/batches\"",
            "endpoint = \"https://ingest.example.com/batches\"\nstreaming = { enabled = true, rate = 50 }",
        );
        let result = BridgeConfig::from_toml_str(&toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_stream_endpoint_is_rejected() {
        let toml_content = MINIMAL.replace("https://ingest.example.com/batches", "not a url");
        let result = BridgeConfig::from_toml_str(&toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_duplicate_device_ids_are_rejected() {
        let toml_content = format!(
            "{MINIMAL}\n[[devices]]\ndevice_id = \"dev-1\"\nstack_name = \"s\"\nthing_name = \"t\"\ntopics = {{ mode = \"all\" }}\n"
        );
        let result = BridgeConfig::from_toml_str(&toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(msg)) if msg.contains("duplicate")));
    }

    #[test]
    fn test_empty_thing_name_is_rejected() {
        let toml_content = MINIMAL.replace("thing_name = \"thing-1\"", "thing_name = \"\"");
        let result = BridgeConfig::from_toml_str(&toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(msg)) if msg.contains("thing_name")));
    }

    #[test]
    fn test_tls_requires_existing_certificates() {
        let toml_content = MINIMAL.replace("tls = false", "tls = true")
            + "\n[certs]\nroot_ca = \"/nonexistent/ca.pem\"\ncert = \"/nonexistent/c.pem\"\nprivate_key = \"/nonexistent/k.pem\"\n";
        let result = BridgeConfig::from_toml_str(&toml_content);
        assert!(matches!(
            result,
            Err(ConfigError::CertificateNotFound { ref name, .. }) if name == "root_ca"
        ));
    }

    #[test]
    fn test_stream_rate_override() {
        let mut config = BridgeConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.stream_rate_for(&config.devices[0]), 5000);

        config.devices[0].stream_rate_ms = Some(250);
        let device = config.devices[0].clone();
        assert_eq!(config.stream_rate_for(&device), 250);
    }
}
