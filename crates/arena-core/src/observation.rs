//! Observation and transition types

use serde::{Deserialize, Serialize};

use crate::action::ActionMasks;
use crate::episode::Outcome;

/// What the agent sees on one tick
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Observation {
    /// Flattened numeric feature vector
    pub features: Vec<f32>,

    /// Per-head legality masks for the next action
    #[serde(default)]
    pub action_masks: ActionMasks,

    /// Simulation tick the observation was taken at
    #[serde(default)]
    pub tick: u64,
}

/// Why a match ended, as reported by the simulation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Win,
    Loss,
    Draw,
    Timeout,
    RuleViolation,
}

impl EndReason {
    /// Outcome from the agent's perspective. Timeouts are natural draws; rule
    /// violations void the episode.
    pub fn outcome(self) -> Outcome {
        match self {
            EndReason::Win => Outcome::Win,
            EndReason::Loss => Outcome::Loss,
            EndReason::Draw | EndReason::Timeout => Outcome::Draw,
            EndReason::RuleViolation => Outcome::Aborted,
        }
    }
}

/// One step's result for one pool slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    /// Pool slot that produced this transition
    pub slot: usize,

    /// Observation after the step
    pub observation: Observation,

    /// Scalar reward signal
    pub reward: f32,

    /// Episode terminated on this step
    pub done: bool,

    /// Slot failed and this transition is synthetic. Mask it out of the loss.
    #[serde(default)]
    pub dropped: bool,

    /// Why the episode ended, when `done` and not dropped
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,

    /// Simulation-specific extras
    #[serde(default)]
    pub info: serde_json::Map<String, serde_json::Value>,
}

impl Transition {
    /// Synthetic no-op transition for a failed slot
    pub fn dropped(slot: usize) -> Self {
        Self {
            slot,
            observation: Observation::default(),
            reward: 0.0,
            done: true,
            dropped: true,
            end_reason: None,
            info: serde_json::Map::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.done && !self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reason_outcomes() {
        assert_eq!(EndReason::Win.outcome(), Outcome::Win);
        assert_eq!(EndReason::Timeout.outcome(), Outcome::Draw);
        assert_eq!(EndReason::RuleViolation.outcome(), Outcome::Aborted);
    }

    #[test]
    fn test_dropped_transition_is_masked() {
        let t = Transition::dropped(3);
        assert_eq!(t.slot, 3);
        assert!(t.done);
        assert!(t.dropped);
        assert!(!t.is_terminal());
        assert_eq!(t.reward, 0.0);
    }

    #[test]
    fn test_end_reason_wire_names() {
        let json = serde_json::to_string(&EndReason::RuleViolation).unwrap();
        assert_eq!(json, "\"rule_violation\"");
    }
}
