//! Pure connection configuration for the MQTT client
//!
//! Broker options, credentials, last will and the client's connection state.

use crate::bridge::topics::TopicBuilder;
use crate::config::MqttSection;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Payload of `<base>/bridge/state` while the bridge is up
pub const STATE_ONLINE: &str = "online";
/// Payload of `<base>/bridge/state` after shutdown or as last will
pub const STATE_OFFLINE: &str = "offline";

/// Connection state for MQTT client
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Initial state - waiting for the first ConnAck
    Connecting,
    /// Broker accepted the session
    Connected,
    /// Disconnected with reason
    Disconnected(String),
    /// Waiting before the next reconnection attempt
    Reconnecting(u32),
    /// Disconnected on request; no reconnects
    Stopped,
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
}

/// Build rumqttc options from config
///
/// The last will marks the bridge offline on `<base>/bridge/state`
/// (QoS 1, retained) if the session drops without a clean disconnect.
pub fn configure_mqtt_options(
    config: &MqttSection,
    topics: &TopicBuilder,
) -> Result<MqttOptions, MqttError> {
    let url = Url::parse(&config.broker_url)
        .map_err(|_| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;

    let host = url
        .host_str()
        .ok_or_else(|| MqttError::InvalidBrokerUrl(config.broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if url.scheme() == "mqtts" { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(config.client_id.clone(), host, port);

    if url.scheme() == "mqtts" {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    // Credentials come from the environment, never from the config file
    if let Some(username_env) = &config.username_env {
        if let Ok(username) = std::env::var(username_env) {
            let password = config
                .password_env
                .as_ref()
                .and_then(|env_name| std::env::var(env_name).ok())
                .unwrap_or_default();
            mqtt_options.set_credentials(&username, &password);
        }
    }

    mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    // Full node dumps and the bridge summary can exceed small broker defaults
    mqtt_options.set_max_packet_size(Some(256 * 1024));

    let lwt = LastWill::new(
        topics.bridge_state(),
        STATE_OFFLINE,
        QoS::AtLeastOnce,
        true,
        None,
    );
    mqtt_options.set_last_will(lwt);

    Ok(mqtt_options)
}
