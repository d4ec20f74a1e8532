//! Crate-level error type
//!
//! Each layer keeps its own error enum; [`BridgeError`] aggregates them for
//! the startup and shutdown paths where one of several layers can fail.

use crate::config::ConfigError;
use crate::matter::ConnectionError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Main error type for bridge operations
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Device connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Bridge is already running")]
    AlreadyRunning,

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type BridgeResult<T> = Result<T, BridgeError>;

impl BridgeError {
    pub fn transport<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Self::Transport(Box::new(error))
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Display text with URL credentials masked, safe for logs
    pub fn sanitized(&self) -> String {
        redact_credentials(&self.to_string())
    }
}

/// Mask `user:password@` in any URL inside `message`
pub fn redact_credentials(message: &str) -> String {
    message
        .split(' ')
        .map(|word| match url::Url::parse(word) {
            Ok(mut url) if url.password().is_some() => {
                let _ = url.set_password(Some("***"));
                url.to_string()
            }
            _ => word.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
