//! Wire protocol for Rust <-> simulation communication
//!
//! One JSON record per line, internally tagged by `kind`:
//! `{"kind":"step","action":[3,0,1],"masks":[[1,1,0],[1,1],[0,1]]}`

use arena_core::{
    Action, ActionMasks, EndReason, Observation, ResetConfig, Transition,
};
use serde::{Deserialize, Serialize};

/// Longest record either side may send, newline excluded
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Observation record body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationPayload {
    pub features: Vec<f32>,
    #[serde(default)]
    pub action_masks: ActionMasks,
    #[serde(default)]
    pub reward: f32,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    #[serde(default)]
    pub tick: u64,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub info: serde_json::Map<String, serde_json::Value>,
}

impl ObservationPayload {
    pub fn observation(&self) -> Observation {
        Observation {
            features: self.features.clone(),
            action_masks: self.action_masks.clone(),
            tick: self.tick,
        }
    }

    pub fn into_transition(self, slot: usize) -> Transition {
        Transition {
            slot,
            observation: Observation {
                features: self.features,
                action_masks: self.action_masks,
                tick: self.tick,
            },
            reward: self.reward,
            done: self.done,
            dropped: false,
            end_reason: self.end_reason,
            info: self.info,
        }
    }
}

/// Records exchanged with the simulation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WireMessage {
    // === Rust -> Simulation ===
    /// Start a new episode
    Reset { config: ResetConfig },

    /// Apply one action. `action` is accepted as an alias.
    #[serde(alias = "action")]
    Step {
        action: Action,
        #[serde(default, skip_serializing_if = "ActionMasks::is_empty")]
        masks: ActionMasks,
    },

    /// Session is going away
    Close,

    // === Simulation -> Rust ===
    /// Reply to `reset` and `step`
    Observation {
        #[serde(flatten)]
        payload: ObservationPayload,
    },

    /// Request rejected; the session stays usable
    Error { message: String },
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Reset { .. } => "reset",
            WireMessage::Step { .. } => "step",
            WireMessage::Close => "close",
            WireMessage::Observation { .. } => "observation",
            WireMessage::Error { .. } => "error",
        }
    }
}

/// Serialize a message to one JSON line, without the trailing newline
pub fn serialize(msg: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(msg)
}

/// Deserialize a message from one JSON line
pub fn deserialize(bytes: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(bytes)
}
