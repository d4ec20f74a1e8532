//! Command translator
//!
//! Inbound bus commands are parsed from their topic, resolved against the
//! registry, encoded into a device request and handed to the device
//! connection. Each command runs as its own task; a semaphore bounds how many
//! are in flight so a stalled device connection cannot pile up tasks.

use super::codec::AttributeCodec;
use super::registry::DeviceRegistry;
use super::topics::{CommandTopic, TopicBuilder};
use crate::matter::{ConnectionError, DeviceCommand, MessageId, Request, RequestSink};
use crate::observability::metrics::BridgeMetrics;
use crate::transport::InboundMessage;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

/// Why a command produced no device request
#[derive(Debug, Error)]
pub enum CommandRejection {
    #[error("Not a command topic: {0}")]
    NotACommand(String),
    #[error("Unknown device identifier: {0}")]
    UnknownDevice(String),
    #[error("Unsupported command {command} for cluster {cluster}")]
    Unsupported { cluster: String, command: String },
    #[error("Device request failed")]
    SendFailed(#[source] ConnectionError),
}

/// Resolves and encodes commands; holds no per-command state
#[derive(Clone)]
pub struct CommandTranslator {
    registry: DeviceRegistry,
    codec: AttributeCodec,
    topics: TopicBuilder,
}

impl CommandTranslator {
    pub fn new(registry: DeviceRegistry, codec: AttributeCodec, topics: TopicBuilder) -> Self {
        Self {
            registry,
            codec,
            topics,
        }
    }

    /// Turn a bus message into a device command without sending it
    pub fn translate(&self, topic: &str, payload: &str) -> Result<DeviceCommand, CommandRejection> {
        let CommandTopic {
            identifier,
            cluster,
            command,
        } = self
            .topics
            .parse_command(topic)
            .ok_or_else(|| CommandRejection::NotACommand(topic.to_string()))?;

        let handle = self
            .registry
            .resolve(&identifier)
            .ok_or(CommandRejection::UnknownDevice(identifier))?;

        self.codec
            .encode(handle, &cluster, &command, payload, None)
            .ok_or(CommandRejection::Unsupported { cluster, command })
    }

    /// Translate and submit; the submission is not retried
    pub async fn execute(
        &self,
        sink: &dyn RequestSink,
        message: &InboundMessage,
    ) -> Result<MessageId, CommandRejection> {
        let payload = String::from_utf8_lossy(&message.payload);
        let command = self.translate(&message.topic, &payload)?;

        info!(
            node_id = command.node_id,
            endpoint = command.endpoint_id,
            command = %command.command_name,
            "Sending device command"
        );
        sink.send(Request::SendCommand(command))
            .await
            .map_err(CommandRejection::SendFailed)
    }
}

/// Drains inbound bus messages, one bounded task per command
pub struct CommandWorker {
    translator: CommandTranslator,
    sink: Arc<dyn RequestSink>,
    metrics: Arc<BridgeMetrics>,
    permits: Arc<Semaphore>,
}

impl CommandWorker {
    pub fn new(
        translator: CommandTranslator,
        sink: Arc<dyn RequestSink>,
        metrics: Arc<BridgeMetrics>,
        concurrency: usize,
    ) -> Self {
        Self {
            translator,
            sink,
            metrics,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Runs until every sender of `receiver` is dropped
    pub async fn run(self, mut receiver: mpsc::Receiver<InboundMessage>) {
        info!("Command worker running");

        while let Some(message) = receiver.recv().await {
            self.metrics.command_received();

            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let translator = self.translator.clone();
            let sink = self.sink.clone();
            let metrics = self.metrics.clone();
            let span = crate::command_span!(&message.topic);

            tokio::spawn(
                async move {
                    let _permit = permit;
                    match translator.execute(sink.as_ref(), &message).await {
                        Ok(message_id) => {
                            metrics.command_sent();
                            debug!(message_id, "Device command queued");
                        }
                        Err(rejection) => {
                            metrics.command_dropped();
                            log_rejection(&rejection);
                        }
                    }
                }
                .instrument(span),
            );
        }

        info!("Command worker stopped");
    }
}

fn log_rejection(rejection: &CommandRejection) {
    match rejection {
        CommandRejection::NotACommand(topic) => debug!(topic = %topic, "Ignoring message"),
        CommandRejection::UnknownDevice(identifier) => {
            warn!(identifier = %identifier, "Dropping command for unknown device")
        }
        CommandRejection::Unsupported { cluster, command } => {
            info!(cluster = %cluster, command = %command, "Dropping unsupported command")
        }
        CommandRejection::SendFailed(e) => error!(error = %e, "Failed to send device command"),
    }
}
