//! Bridge configuration system
//!
//! Configuration is read from a TOML file, then overridden by the environment
//! variables the containerised deployment uses, then validated. Every field
//! has a default so an empty file is a complete configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use url::Url;

/// Main bridge configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BridgeConfig {
    #[serde(default)]
    pub matter: MatterSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub bridge: BridgeSection,
    /// Stable identifier overrides keyed by device handle (node id)
    #[serde(default)]
    pub devices: HashMap<String, DeviceOverride>,
}

/// Device-server websocket section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatterSection {
    /// Websocket URL of the matter-server
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Fixed delay between reconnection attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Transport-level timeout for a single connection attempt
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Endpoint targeted by outbound commands
    #[serde(default = "default_endpoint")]
    pub default_endpoint: u16,
}

impl Default for MatterSection {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            reconnect_delay_secs: default_reconnect_delay(),
            connect_timeout_secs: default_connect_timeout(),
            default_endpoint: default_endpoint(),
        }
    }
}

/// MQTT section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// MQTT broker URL with protocol and port
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Client identifier presented to the broker
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Environment variable containing username
    #[serde(default = "default_username_env")]
    pub username_env: Option<String>,
    /// Environment variable containing password
    #[serde(default = "default_password_env")]
    pub password_env: Option<String>,
    /// Root of every topic the bridge publishes or subscribes to
    #[serde(default = "default_base_topic")]
    pub base_topic: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker_url: default_broker_url(),
            client_id: default_client_id(),
            username_env: default_username_env(),
            password_env: default_password_env(),
            base_topic: default_base_topic(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

/// Bridge behaviour section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSection {
    /// Period of the bridge summary publication
    #[serde(default = "default_info_interval")]
    pub info_interval_secs: u64,
    /// Maximum number of commands translated concurrently
    #[serde(default = "default_command_concurrency")]
    pub command_concurrency: usize,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            info_interval_secs: default_info_interval(),
            command_concurrency: default_command_concurrency(),
        }
    }
}

/// Per-device override
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceOverride {
    pub friendly_name: String,
}

fn default_server_url() -> String {
    "ws://localhost:5580/ws".to_string()
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_endpoint() -> u16 {
    1
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_client_id() -> String {
    "matter-mqtt-bridge".to_string()
}

fn default_username_env() -> Option<String> {
    Some("MQTT_USERNAME".to_string())
}

fn default_password_env() -> Option<String> {
    Some("MQTT_PASSWORD".to_string())
}

fn default_base_topic() -> String {
    "matter".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_info_interval() -> u64 {
    60
}

fn default_command_concurrency() -> usize {
    16
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Device key '{0}' is not a numeric node id")]
    InvalidDeviceKey(String),
    #[error("Invalid friendly name '{name}' for node {node_id}")]
    InvalidFriendlyName { node_id: u64, name: String },
}

impl BridgeConfig {
    /// Load configuration from a TOML file, apply environment overrides and validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Parse configuration text, apply environment overrides and validate
    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: BridgeConfig = toml::from_str(content)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, used when no file is present
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = BridgeConfig::default();
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `MATTER_SERVER_URL`, `MQTT_BROKER`, `MQTT_PORT` and `MQTT_BASE_TOPIC`
    ///
    /// The lookup is injected so tests never touch the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("MATTER_SERVER_URL") {
            self.matter.server_url = url;
        }

        let broker = lookup("MQTT_BROKER");
        let port = lookup("MQTT_PORT");
        if broker.is_some() || port.is_some() {
            let current = Url::parse(&self.mqtt.broker_url).ok();
            let scheme = current
                .as_ref()
                .map(|u| u.scheme().to_string())
                .unwrap_or_else(|| "mqtt".to_string());
            let host = broker.unwrap_or_else(|| {
                current
                    .as_ref()
                    .and_then(|u| u.host_str().map(str::to_string))
                    .unwrap_or_else(|| "localhost".to_string())
            });
            let port = port.unwrap_or_else(|| {
                current
                    .as_ref()
                    .and_then(|u| u.port())
                    .unwrap_or(if scheme == "mqtts" { 8883 } else { 1883 })
                    .to_string()
            });
            self.mqtt.broker_url = format!("{scheme}://{host}:{port}");
        }

        if let Some(base) = lookup("MQTT_BASE_TOPIC") {
            self.mqtt.base_topic = base;
        }
    }

    /// Validate the configuration as a whole
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_base_topic(&self.mqtt.base_topic)?;

        let server = Url::parse(&self.matter.server_url).map_err(|_| {
            ConfigError::InvalidConfig(format!(
                "matter.server_url '{}' is not a valid URL",
                self.matter.server_url
            ))
        })?;
        if !matches!(server.scheme(), "ws" | "wss") {
            return Err(ConfigError::InvalidConfig(format!(
                "matter.server_url must use ws:// or wss://, got '{}'",
                self.matter.server_url
            )));
        }

        let broker = Url::parse(&self.mqtt.broker_url).map_err(|_| {
            ConfigError::InvalidConfig(format!(
                "mqtt.broker_url '{}' is not a valid URL",
                self.mqtt.broker_url
            ))
        })?;
        if !matches!(broker.scheme(), "mqtt" | "mqtts") {
            return Err(ConfigError::InvalidConfig(format!(
                "mqtt.broker_url must use mqtt:// or mqtts://, got '{}'",
                self.mqtt.broker_url
            )));
        }

        if self.matter.reconnect_delay_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "matter.reconnect_delay_secs must be greater than 0".to_string(),
            ));
        }
        if self.bridge.info_interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.info_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.bridge.command_concurrency == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.command_concurrency must be greater than 0".to_string(),
            ));
        }

        self.identifier_overrides().map(|_| ())
    }

    /// Device overrides keyed by numeric handle
    pub fn identifier_overrides(&self) -> Result<HashMap<u64, String>, ConfigError> {
        let mut overrides = HashMap::with_capacity(self.devices.len());
        for (key, device) in &self.devices {
            let node_id: u64 = key
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidDeviceKey(key.clone()))?;
            validate_friendly_name(node_id, &device.friendly_name)?;
            overrides.insert(node_id, device.friendly_name.clone());
        }
        Ok(overrides)
    }

    /// Resolve the MQTT username from its environment variable
    pub fn get_mqtt_username(&self) -> Option<String> {
        self.mqtt
            .username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Resolve the MQTT password from its environment variable
    pub fn get_mqtt_password(&self) -> Option<String> {
        self.mqtt
            .password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }
}

fn validate_base_topic(base: &str) -> Result<(), ConfigError> {
    if base.is_empty()
        || base.starts_with('/')
        || base.ends_with('/')
        || base.contains('+')
        || base.contains('#')
    {
        return Err(ConfigError::InvalidConfig(format!(
            "mqtt.base_topic '{base}' must be non-empty, without wildcards or surrounding '/'"
        )));
    }
    Ok(())
}

fn validate_friendly_name(node_id: u64, name: &str) -> Result<(), ConfigError> {
    let invalid = name.trim().is_empty() || name.chars().any(|c| matches!(c, '/' | '+' | '#'));
    if invalid {
        return Err(ConfigError::InvalidFriendlyName {
            node_id,
            name: name.to_string(),
        });
    }
    Ok(())
}
