//! Pure reconnection decisions for the MQTT subscription
//!
//! The session loop reports what happened; this module decides which state
//! to publish and whether, and when, to try again.

use super::connection::{ConnectionState, ReconnectConfig};
use std::time::Duration;
use tracing::{error, info, warn};

/// Stateless decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// State published right after a counted failure
    pub fn failure_state(attempt: u32) -> ConnectionState {
        if attempt <= 1 {
            ConnectionState::Disconnected
        } else {
            ConnectionState::Reconnecting
        }
    }

    /// Decide what follows a transport error.
    ///
    /// `attempts_so_far` is the consecutive failure count before this error.
    /// An error on a session that was running counts as a link loss: it is
    /// reported as offline, leaves the counter alone and retries after the
    /// base delay.
    pub fn on_transport_error(
        attempts_so_far: u32,
        was_running: bool,
        config: &ReconnectConfig,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if was_running {
            return ReconnectionDecision::Proceed {
                attempt: attempts_so_far,
                delay: config.base_delay,
                state: ConnectionState::Offline,
            };
        }

        let attempt = attempts_so_far.saturating_add(1);
        if attempt >= config.max_attempts {
            return ReconnectionDecision::AbortMaxAttemptsExceeded { attempts: attempt };
        }

        ReconnectionDecision::Proceed {
            attempt,
            delay: config.calculate_backoff_delay(attempt),
            state: Self::failure_state(attempt),
        }
    }

    /// Determine next state after a connection event
    pub fn determine_next_state(event: &ConnectionEvent) -> ConnectionState {
        match event {
            ConnectionEvent::ConnAckReceived => ConnectionState::Running,
            ConnectionEvent::SubscriptionRejected(_) => ConnectionState::Error,
            ConnectionEvent::DisconnectedByBroker => ConnectionState::Disconnected,
            ConnectionEvent::PermanentFailure(_) => ConnectionState::Error,
        }
    }

    /// Log a state transition at a level matching its severity
    pub fn log_state_transition(from: ConnectionState, to: ConnectionState) {
        match to {
            ConnectionState::Running => info!(%from, %to, "MQTT subscription running"),
            ConnectionState::Offline | ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                warn!(%from, %to, "MQTT connection degraded")
            }
            ConnectionState::Error => error!(%from, %to, "MQTT subscription failed"),
            _ => info!(%from, %to, "MQTT state change"),
        }
    }
}

/// Outcome of a reconnection decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectionDecision {
    /// Publish `state`, wait `delay`, then build a fresh connection
    Proceed {
        attempt: u32,
        delay: Duration,
        state: ConnectionState,
    },
    AbortShutdownRequested,
    AbortMaxAttemptsExceeded { attempts: u32 },
}

/// Connection events that map directly to a state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnAckReceived,
    SubscriptionRejected(String),
    DisconnectedByBroker,
    PermanentFailure(String),
}
