//! Structured logging using tracing
//!
//! ## Log Format Options
//!
//! `LOG_FORMAT` selects the output:
//!
//! - `json` - structured JSON for log aggregation (default)
//! - `pretty` - multi-line, coloured output for development
//! - `compact` - coloured single-line output for terminals
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE (default INFO)
//! - `LOG_FORMAT`: json, pretty or compact (default json)
//! - `LOG_SPANS`: emit span open/close events (`true`/`false`, default false)
//! - `RUST_LOG`: replaces the level filter entirely
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG ./matter-mqtt-bridge
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies that log far more than the bridge itself
const QUIET_TARGETS: &[&str] = &["rumqttc", "tungstenite", "tokio_tungstenite"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse `LOG_LEVEL`; unknown values mean INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Level filter with noisy dependencies capped at WARN
pub fn build_filter(level: Level) -> EnvFilter {
    QUIET_TARGETS
        .iter()
        .filter_map(|target| format!("{target}=warn").parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

/// Initialize logging with manual configuration
///
/// Does nothing if a global subscriber is already installed.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) {
    let filter = match env::var("RUST_LOG") {
        Ok(rust_log) => EnvFilter::new(rust_log),
        Err(_) => build_filter(level),
    };
    let span_events = if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .try_init(),
    };

    if let Err(e) = result {
        eprintln!("Logging already initialised: {e}");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    init_logging(level, format, include_spans);
}

/// Span for work on the device server connection
#[macro_export]
macro_rules! matter_span {
    ($($field:tt)*) => {
        tracing::info_span!("matter_connection", $($field)*)
    };
}

/// Create an MQTT operation span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Span for one inbound command, keyed by its topic
#[macro_export]
macro_rules! command_span {
    ($topic:expr) => {
        tracing::info_span!("command", topic = %$topic)
    };
}

/// Create a lifecycle event span
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}

pub use {command_span, lifecycle_span, matter_span, mqtt_span};
