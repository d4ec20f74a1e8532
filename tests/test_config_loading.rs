//! Configuration loading and validation tests
//!
//! Behaviour of loading from files: defaults, device overrides and the errors
//! a bad file produces.

use matter_mqtt_bridge::config::{BridgeConfig, ConfigError};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[matter]
server_url = "ws://matter.lan:5580/ws"
reconnect_delay_secs = 3
default_endpoint = 2

[mqtt]
broker_url = "mqtt://broker.lan:1883"
base_topic = "home"

[bridge]
info_interval_secs = 120
command_concurrency = 4

[devices.12]
friendly_name = "kitchen-lamp"
"#,
    );

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.matter.server_url, "ws://matter.lan:5580/ws");
    assert_eq!(config.matter.reconnect_delay_secs, 3);
    assert_eq!(config.matter.default_endpoint, 2);
    assert_eq!(config.mqtt.base_topic, "home");
    assert_eq!(config.bridge.info_interval_secs, 120);
    assert_eq!(config.bridge.command_concurrency, 4);
    assert_eq!(
        config.identifier_overrides().unwrap().get(&12).map(String::as_str),
        Some("kitchen-lamp")
    );
}

#[test]
fn test_empty_file_is_all_defaults() {
    let temp_file = write_config("");
    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.matter.connect_timeout_secs, 10);
    assert_eq!(config.mqtt.keep_alive_secs, 60);
    assert_eq!(config.mqtt.username_env.as_deref(), Some("MQTT_USERNAME"));
    assert_eq!(config.bridge.command_concurrency, 16);
}

#[test]
fn test_missing_file_is_a_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = BridgeConfig::load_from_file(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_malformed_toml_is_a_parse_error() {
    let temp_file = write_config("[mqtt\nbroker_url = ");
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_zero_interval_rejected() {
    let temp_file = write_config("[bridge]\ninfo_interval_secs = 0");
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_wildcard_friendly_name_rejected() {
    let temp_file = write_config("[devices.4]\nfriendly_name = \"sensor#1\"");
    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(
        result,
        Err(ConfigError::InvalidFriendlyName { node_id: 4, .. })
    ));
}

#[test]
fn test_config_round_trips_through_show_output() {
    let config = BridgeConfig::default();
    let rendered = toml::to_string_pretty(&config).unwrap();
    let parsed: BridgeConfig = toml::from_str(&rendered).unwrap();
    assert_eq!(parsed, config);
}
