//! Task kinds and per-episode reset configuration

use serde::{Deserialize, Serialize};

use crate::episode::OpponentRef;

/// Kind of task a match trains. Closed set; adding a kind is a compile-time change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Combat,
    Skilling,
    Exploration,
    Idle,
}

impl TaskKind {
    /// Scenario the simulation loads for this kind
    pub fn scenario(self) -> &'static str {
        match self {
            TaskKind::Combat => "nh_duel",
            TaskKind::Skilling => "skilling",
            TaskKind::Exploration => "exploration",
            TaskKind::Idle => "idle",
        }
    }

    /// Tick limit before the simulation declares a timeout
    pub fn default_max_ticks(self) -> u64 {
        match self {
            TaskKind::Combat => 1_000,
            TaskKind::Skilling => 5_000,
            TaskKind::Exploration => 3_000,
            TaskKind::Idle => 100,
        }
    }

    /// Whether episodes of this kind have a rated opponent
    pub fn is_competitive(self) -> bool {
        match self {
            TaskKind::Combat => true,
            TaskKind::Skilling | TaskKind::Exploration | TaskKind::Idle => false,
        }
    }
}

/// Sent with every `reset` record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResetConfig {
    pub task: TaskKind,
    pub scenario: String,
    pub opponent: OpponentRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    pub max_ticks: u64,
    /// Simulation-specific extras, passed through untouched
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ResetConfig {
    pub fn new(task: TaskKind, opponent: OpponentRef) -> Self {
        Self {
            task,
            scenario: task.scenario().to_string(),
            opponent,
            seed: None,
            max_ticks: task.default_max_ticks(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotVersion;

    #[test]
    fn test_reset_config_defaults_from_task() {
        let config = ResetConfig::new(TaskKind::Combat, OpponentRef::Snapshot(SnapshotVersion(4)))
            .with_seed(9);
        assert_eq!(config.scenario, "nh_duel");
        assert_eq!(config.max_ticks, 1_000);

        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["task"], "combat");
        assert_eq!(json["opponent"]["id"], 4);
        assert_eq!(json["seed"], 9);
        assert!(json.get("extra").is_none());
    }

    #[test]
    fn test_only_combat_is_rated() {
        assert!(TaskKind::Combat.is_competitive());
        assert!(!TaskKind::Idle.is_competitive());
    }
}
