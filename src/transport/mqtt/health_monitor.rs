//! Pure connection state transitions and reconnection decisions

use super::connection::ConnectionState;
use std::time::Duration;
use tracing::{error, info, warn};

/// Delay schedule between broker reconnection attempts
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delays for the first attempts, in order
    pub backoff: Vec<Duration>,
    /// Delay once the schedule is exhausted
    pub sustained: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: vec![
                Duration::from_millis(500),
                Duration::from_secs(1),
                Duration::from_secs(2),
            ],
            sustained: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff.get(index).copied().unwrap_or(self.sustained)
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    Proceed { attempt: u32, delay: Duration },
    AbortShutdownRequested,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    StopRequested,
}

/// Pure health decisions for the broker connection
pub struct HealthMonitor;

impl HealthMonitor {
    /// Broker reconnects are unlimited; only shutdown stops them
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        policy: &ReconnectPolicy,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay: policy.delay_for(attempt),
        }
    }

    /// Next state after a connection event
    pub fn determine_next_state(event: ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => {
                info!("MQTT broker accepted the session");
                ConnectionState::Connected
            }
            ConnectionEvent::DisconnectedByBroker => {
                warn!("MQTT broker disconnected the bridge");
                ConnectionState::Disconnected("Broker disconnected".to_string())
            }
            ConnectionEvent::NetworkError(error) => {
                error!(error = %error, "MQTT event loop error");
                ConnectionState::Disconnected(error)
            }
            ConnectionEvent::ReconnectionStarted(attempt) => {
                info!(attempt, "Reconnecting to MQTT broker");
                ConnectionState::Reconnecting(attempt)
            }
            ConnectionEvent::StopRequested => ConnectionState::Stopped,
        }
    }

    /// Publishing and subscribing need a live session
    pub fn can_publish(state: &ConnectionState) -> bool {
        matches!(state, ConnectionState::Connected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_schedule() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(5));
        assert_eq!(policy.delay_for(1000), Duration::from_secs(5));
    }

    #[test]
    fn test_reconnection_is_unlimited() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(10_000, &policy, false),
            ReconnectionDecision::Proceed {
                attempt: 10_001,
                delay: Duration::from_secs(5)
            }
        );
    }

    #[test]
    fn test_shutdown_aborts_reconnection() {
        assert_eq!(
            HealthMonitor::should_attempt_reconnection(0, &ReconnectPolicy::default(), true),
            ReconnectionDecision::AbortShutdownRequested
        );
    }

    #[test]
    fn test_state_transitions() {
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ConnAckReceived),
            ConnectionState::Connected
        );
        assert_eq!(
            HealthMonitor::determine_next_state(ConnectionEvent::ReconnectionStarted(2)),
            ConnectionState::Reconnecting(2)
        );
        assert!(matches!(
            HealthMonitor::determine_next_state(ConnectionEvent::NetworkError("refused".into())),
            ConnectionState::Disconnected(reason) if reason == "refused"
        ));
    }

    #[test]
    fn test_can_publish_only_when_connected() {
        assert!(HealthMonitor::can_publish(&ConnectionState::Connected));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Connecting));
        assert!(!HealthMonitor::can_publish(&ConnectionState::Stopped));
    }
}
