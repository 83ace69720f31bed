//! Alarm state machine
//!
//! Tracks the lifecycle state of each rule and the history of transitions.
//!
//! ```text
//! Inactive ──▶ Active ──▶ Acknowledged
//!    ▲           │  ▲          │
//!    │           ▼  │          ▼
//!    └──────── Cleared ◀───────┘
//! ```

use chrono::{DateTime, Utc};
use errors::{GatewayError, GatewayResult};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::debug;

use crate::types::AlarmState;

/// Transitions kept per rule; older entries are dropped first
pub const MAX_TRANSITION_HISTORY: usize = 256;

/// Read-only view of rule states, polled by looping actions
pub trait StateSource: Send + Sync {
    fn state(&self, rule_id: &str) -> AlarmState;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateTransition {
    pub from: AlarmState,
    pub to: AlarmState,
    pub timestamp: DateTime<Utc>,
    /// trigger / acknowledge / recover / reset / force
    pub reason: String,
    pub user: Option<String>,
}

/// Whether `from -> to` is a legal lifecycle step
pub fn is_valid_transition(from: AlarmState, to: AlarmState) -> bool {
    use AlarmState::*;
    matches!(
        (from, to),
        (Inactive, Active)
            | (Active, Acknowledged)
            | (Active, Cleared)
            | (Acknowledged, Cleared)
            | (Cleared, Active)
            | (Cleared, Inactive)
    )
}

#[derive(Default)]
struct RuleTrack {
    state: AlarmState,
    history: Vec<StateTransition>,
}

impl RuleTrack {
    fn record(&mut self, to: AlarmState, reason: &str, user: Option<&str>) -> StateTransition {
        let transition = StateTransition {
            from: self.state,
            to,
            timestamp: Utc::now(),
            reason: reason.to_string(),
            user: user.map(str::to_string),
        };
        if self.history.len() >= MAX_TRANSITION_HISTORY {
            self.history.remove(0);
        }
        self.history.push(transition.clone());
        self.state = to;
        transition
    }
}

#[derive(Default)]
pub struct AlarmStateMachine {
    rules: RwLock<FxHashMap<String, RuleTrack>>,
}

impl AlarmStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state; unknown rules are inactive
    pub fn state(&self, rule_id: &str) -> AlarmState {
        self.rules
            .read()
            .get(rule_id)
            .map(|track| track.state)
            .unwrap_or_default()
    }

    pub fn can_transition(&self, rule_id: &str, to: AlarmState) -> bool {
        is_valid_transition(self.state(rule_id), to)
    }

    /// Move a rule to `to`, failing with `InvalidTransition` on an illegal step
    pub fn transition(
        &self,
        rule_id: &str,
        to: AlarmState,
        reason: &str,
        user: Option<&str>,
    ) -> GatewayResult<StateTransition> {
        let mut rules = self.rules.write();
        let track = rules.entry(rule_id.to_string()).or_default();
        if !is_valid_transition(track.state, to) {
            return Err(GatewayError::InvalidTransition {
                from: track.state.to_string(),
                to: to.to_string(),
            });
        }
        let transition = track.record(to, reason, user);
        debug!("Rule {} state {} -> {} ({})", rule_id, transition.from, to, reason);
        Ok(transition)
    }

    /// Set a state without checking the lifecycle; still recorded
    pub fn force_transition(&self, rule_id: &str, to: AlarmState, reason: &str) -> StateTransition {
        let mut rules = self.rules.write();
        let track = rules.entry(rule_id.to_string()).or_default();
        let transition = track.record(to, reason, None);
        debug!("Rule {} forced {} -> {} ({})", rule_id, transition.from, to, reason);
        transition
    }

    pub fn history(&self, rule_id: &str) -> Vec<StateTransition> {
        self.rules
            .read()
            .get(rule_id)
            .map(|track| track.history.clone())
            .unwrap_or_default()
    }

    /// Forget a rule entirely
    pub fn remove(&self, rule_id: &str) {
        self.rules.write().remove(rule_id);
    }
}

impl StateSource for AlarmStateMachine {
    fn state(&self, rule_id: &str) -> AlarmState {
        AlarmStateMachine::state(self, rule_id)
    }
}
