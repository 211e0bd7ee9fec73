//! Connection State Tracking
//!
//! Provides the per-connection state machine and the tracker recording its
//! transitions.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// Lifecycle of one device connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, `start()` not called yet
    Idle,
    /// A connect attempt is in flight
    Connecting,
    /// Socket open, heartbeat running
    Open,
    /// Graceful close requested
    Closing,
    /// Waiting for a backoff delay before the next attempt
    Reconnecting,
    /// Terminal; the connection will never reconnect
    Stopped,
}

impl ConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Stopped)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Closing => write!(f, "Closing"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// State transition information
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

const MAX_TRANSITIONS: usize = 32;

struct StateInner {
    current: ConnectionState,
    last_opened: Option<DateTime<Utc>>,
    transitions: Vec<StateTransition>,
}

/// Thread-safe state holder for a single connection
pub struct StateTracker {
    inner: RwLock<StateInner>,
}

impl StateTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StateInner {
                current: ConnectionState::Idle,
                last_opened: None,
                transitions: Vec::new(),
            }),
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.inner.read().current
    }

    pub fn last_opened(&self) -> Option<DateTime<Utc>> {
        self.inner.read().last_opened
    }

    /// Move to `new_state` if the graph allows it. Returns false when the
    /// transition was rejected.
    pub fn transition_to(&self, new_state: ConnectionState, reason: Option<String>) -> bool {
        let mut inner = self.inner.write();

        if !is_valid_transition(inner.current, new_state) {
            tracing::trace!(
                from = %inner.current,
                to = %new_state,
                "Rejected connection state transition"
            );
            return false;
        }
        if inner.current == new_state {
            return true;
        }

        let now = Utc::now();
        let from = inner.current;
        inner.transitions.push(StateTransition {
            from,
            to: new_state,
            timestamp: now,
            reason,
        });
        if inner.transitions.len() > MAX_TRANSITIONS {
            inner.transitions.remove(0);
        }

        if new_state == ConnectionState::Open {
            inner.last_opened = Some(now);
        }
        inner.current = new_state;

        true
    }

    /// Most recent transitions, newest first
    pub fn recent_transitions(&self, count: usize) -> Vec<StateTransition> {
        let inner = self.inner.read();
        inner.transitions.iter().rev().take(count).cloned().collect()
    }

    pub fn is_stopped(&self) -> bool {
        self.current() == ConnectionState::Stopped
    }
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn is_valid_transition(from: ConnectionState, to: ConnectionState) -> bool {
    use ConnectionState::*;

    // Self-transition is always allowed
    if from == to {
        return true;
    }

    matches!(
        (from, to),
        (Idle, Connecting) |
        (Idle, Stopped) |
        // Connect succeeded, failed, or was abandoned
        (Connecting, Open) |
        (Connecting, Reconnecting) |
        (Connecting, Stopped) |
        // Disconnect
        (Open, Connecting) |
        (Open, Reconnecting) |
        (Open, Closing) |
        (Open, Stopped) |
        (Closing, Stopped) |
        // Backoff elapsed or a discovery tick forced an early attempt
        (Reconnecting, Connecting) |
        (Reconnecting, Stopped)
    )
}
