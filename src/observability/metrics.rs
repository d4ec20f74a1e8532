//! Thread-safe bridge metrics
//!
//! Atomic counters owned by one bridge context and shared by reference with
//! the connection manager, publisher and command worker. A snapshot is
//! embedded in the periodic bridge summary.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Counters for one running bridge
#[derive(Debug)]
pub struct BridgeMetrics {
    // Device connection
    device_connected: AtomicBool,
    device_connections_established: AtomicU64,
    device_reconnects: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,

    // Bus publication
    attributes_published: AtomicU64,
    attributes_skipped: AtomicU64,
    publish_failures: AtomicU64,

    // Commands
    commands_received: AtomicU64,
    commands_sent: AtomicU64,
    commands_dropped: AtomicU64,

    started_at: AtomicU64,
}

impl BridgeMetrics {
    pub fn new() -> Self {
        Self {
            device_connected: AtomicBool::new(false),
            device_connections_established: AtomicU64::new(0),
            device_reconnects: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            attributes_published: AtomicU64::new(0),
            attributes_skipped: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            commands_sent: AtomicU64::new(0),
            commands_dropped: AtomicU64::new(0),
            started_at: AtomicU64::new(current_timestamp()),
        }
    }

    pub fn device_connection_established(&self) {
        self.device_connections_established
            .fetch_add(1, Ordering::Relaxed);
        self.device_connected.store(true, Ordering::Relaxed);
    }

    pub fn device_connection_lost(&self) {
        self.device_connected.store(false, Ordering::Relaxed);
    }

    pub fn device_reconnect_scheduled(&self) {
        self.device_reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn attribute_published(&self) {
        self.attributes_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn attribute_skipped(&self) {
        self.attributes_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_sent(&self) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_dropped(&self) {
        self.commands_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        MetricsSnapshot {
            device_connection: DeviceConnectionMetrics {
                connected: self.device_connected.load(Ordering::Relaxed),
                connections_established: self
                    .device_connections_established
                    .load(Ordering::Relaxed),
                reconnects: self.device_reconnects.load(Ordering::Relaxed),
                frames_received: self.frames_received.load(Ordering::Relaxed),
                frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            },
            publishing: PublishMetrics {
                attributes_published: self.attributes_published.load(Ordering::Relaxed),
                attributes_skipped: self.attributes_skipped.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
            },
            commands: CommandMetrics {
                received: self.commands_received.load(Ordering::Relaxed),
                sent: self.commands_sent.load(Ordering::Relaxed),
                dropped: self.commands_dropped.load(Ordering::Relaxed),
            },
            uptime_seconds: now.saturating_sub(self.started_at.load(Ordering::Relaxed)),
        }
    }
}

impl Default for BridgeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub device_connection: DeviceConnectionMetrics,
    pub publishing: PublishMetrics,
    pub commands: CommandMetrics,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceConnectionMetrics {
    pub connected: bool,
    pub connections_established: u64,
    pub reconnects: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishMetrics {
    pub attributes_published: u64,
    pub attributes_skipped: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandMetrics {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_connection_metrics() {
        let metrics = BridgeMetrics::new();

        metrics.device_connection_established();
        metrics.frame_received();
        metrics.frame_dropped();
        metrics.device_connection_lost();
        metrics.device_reconnect_scheduled();

        let snapshot = metrics.snapshot();
        assert!(!snapshot.device_connection.connected);
        assert_eq!(snapshot.device_connection.connections_established, 1);
        assert_eq!(snapshot.device_connection.reconnects, 1);
        assert_eq!(snapshot.device_connection.frames_received, 1);
        assert_eq!(snapshot.device_connection.frames_dropped, 1);
    }

    #[test]
    fn test_command_metrics() {
        let metrics = BridgeMetrics::new();

        metrics.command_received();
        metrics.command_received();
        metrics.command_sent();
        metrics.command_dropped();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.commands.received, 2);
        assert_eq!(snapshot.commands.sent, 1);
        assert_eq!(snapshot.commands.dropped, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = BridgeMetrics::new();
        metrics.attribute_published();
        metrics.publish_failed();

        let value = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(value["publishing"]["attributes_published"], 1);
        assert_eq!(value["publishing"]["publish_failures"], 1);
        assert!(value["uptime_seconds"].is_u64());
    }

    #[test]
    fn test_concurrent_updates() {
        let metrics = Arc::new(BridgeMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..100 {
                        metrics.attribute_published();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(metrics.snapshot().publishing.attributes_published, 800);
    }
}
