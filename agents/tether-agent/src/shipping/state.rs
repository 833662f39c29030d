//! Shipper State Management
//!
//! Provides the shipper lifecycle state machine and a manager that records
//! recent transitions for diagnostics.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

/// Maximum number of transitions kept in history
const MAX_TRANSITIONS: usize = 100;

/// Lifecycle of the batch shipper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShipperState {
    /// Never initialized
    NotStarted,
    /// Accepting records and shipping batches
    Running,
    /// Stopping the worker and draining
    ShuttingDown,
    /// Session ended; may be initialized again
    Stopped,
}

impl std::fmt::Display for ShipperState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShipperState::NotStarted => write!(f, "NotStarted"),
            ShipperState::Running => write!(f, "Running"),
            ShipperState::ShuttingDown => write!(f, "ShuttingDown"),
            ShipperState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// State transition information
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: ShipperState,
    pub to: ShipperState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

struct ShipperStateInner {
    current: ShipperState,
    sessions: u32,
    transitions: Vec<StateTransition>,
}

/// Thread-safe shipper state manager
#[derive(Clone)]
pub struct ShipperStateManager {
    inner: Arc<RwLock<ShipperStateInner>>,
}

impl ShipperStateManager {
    /// Create a new state manager starting in NotStarted
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ShipperStateInner {
                current: ShipperState::NotStarted,
                sessions: 0,
                transitions: Vec::new(),
            })),
        }
    }

    pub fn current_state(&self) -> ShipperState {
        self.inner.read().current
    }

    /// Number of sessions started so far
    pub fn sessions(&self) -> u32 {
        self.inner.read().sessions
    }

    /// Transition to a new state, returning false if the move is not allowed
    pub fn transition_to(&self, new_state: ShipperState, reason: Option<String>) -> bool {
        let mut inner = self.inner.write();
        Self::apply(&mut inner, new_state, reason)
    }

    fn apply(inner: &mut ShipperStateInner, new_state: ShipperState, reason: Option<String>) -> bool {
        if !Self::is_valid_transition(inner.current, new_state) {
            return false;
        }

        let old_state = inner.current;
        inner.current = new_state;

        if new_state == ShipperState::Running && old_state != ShipperState::Running {
            inner.sessions += 1;
        }

        inner.transitions.push(StateTransition {
            from: old_state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });

        if inner.transitions.len() > MAX_TRANSITIONS {
            inner.transitions.remove(0);
        }

        tracing::info!(
            from = %old_state,
            to = %new_state,
            session = inner.sessions,
            "Shipper state transition"
        );

        true
    }

    fn is_valid_transition(from: ShipperState, to: ShipperState) -> bool {
        if from == to {
            return true;
        }

        matches!(
            (from, to),
            (ShipperState::NotStarted, ShipperState::Running) |
            (ShipperState::Running, ShipperState::ShuttingDown) |
            (ShipperState::ShuttingDown, ShipperState::Stopped) |
            // Shutdown ends a session, not the process
            (ShipperState::Stopped, ShipperState::Running)
        )
    }

    /// Move into Running; false if already running or mid-shutdown
    pub fn start(&self) -> bool {
        let mut inner = self.inner.write();
        if matches!(
            inner.current,
            ShipperState::Running | ShipperState::ShuttingDown
        ) {
            return false;
        }
        Self::apply(
            &mut inner,
            ShipperState::Running,
            Some("Initialize requested".to_string()),
        )
    }

    pub fn set_shutting_down(&self) -> bool {
        self.transition_to(
            ShipperState::ShuttingDown,
            Some("Shutdown requested".to_string()),
        )
    }

    pub fn set_stopped(&self) -> bool {
        self.transition_to(ShipperState::Stopped, Some("Drain complete".to_string()))
    }

    pub fn is_running(&self) -> bool {
        self.current_state() == ShipperState::Running
    }

    /// Get recent state transitions, newest first
    pub fn recent_transitions(&self, count: usize) -> Vec<StateTransition> {
        let inner = self.inner.read();
        inner.transitions.iter().rev().take(count).cloned().collect()
    }
}

impl Default for ShipperStateManager {
    fn default() -> Self {
        Self::new()
    }
}
