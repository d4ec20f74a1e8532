//! Observability: structured logging and per-bridge metrics
//!
//! Metrics are not exported over HTTP; their snapshot rides along in the
//! periodic bridge summary.

pub mod logging;
pub mod metrics;

pub use logging::{init_default_logging, init_logging, LogFormat};
pub use metrics::{BridgeMetrics, MetricsSnapshot};

// Span macros for structured logging
pub use logging::{command_span, lifecycle_span, matter_span, mqtt_span};
