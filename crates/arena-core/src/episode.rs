//! Episodes, outcomes and opponent references

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::snapshot::SnapshotVersion;

/// Unique identifier for an episode within one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(pub u64);

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

/// Match result from the agent's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Win,
    Loss,
    Draw,
    /// Disconnect or rule violation before a natural end. Void: no rating update.
    Aborted,
}

impl Outcome {
    /// Score for the agent, `None` for void outcomes
    pub fn score(self) -> Option<f64> {
        match self {
            Outcome::Win => Some(1.0),
            Outcome::Draw => Some(0.5),
            Outcome::Loss => Some(0.0),
            Outcome::Aborted => None,
        }
    }

    /// The same result seen from the other side
    pub fn flipped(self) -> Self {
        match self {
            Outcome::Win => Outcome::Loss,
            Outcome::Loss => Outcome::Win,
            other => other,
        }
    }

    pub fn is_void(self) -> bool {
        matches!(self, Outcome::Aborted)
    }
}

/// Who the agent is fighting
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum OpponentRef {
    /// A past policy snapshot from the opponent pool
    Snapshot(SnapshotVersion),
    /// A scripted bot built into the simulation
    Scripted(String),
}

impl OpponentRef {
    pub fn snapshot_version(&self) -> Option<SnapshotVersion> {
        match self {
            OpponentRef::Snapshot(v) => Some(*v),
            OpponentRef::Scripted(_) => None,
        }
    }
}

impl fmt::Display for OpponentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpponentRef::Snapshot(v) => write!(f, "{}", v),
            OpponentRef::Scripted(name) => write!(f, "scripted:{}", name),
        }
    }
}

/// One match from reset to terminal
#[derive(Debug, Clone)]
pub struct Episode {
    pub id: EpisodeId,
    /// Pool slot the match runs in
    pub slot: usize,
    pub opponent: OpponentRef,
    pub start_tick: u64,
    outcome: Option<Outcome>,
    reported: bool,
}

/// Closed episode handed to the rating logic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeReport {
    pub episode_id: EpisodeId,
    pub slot: usize,
    pub opponent: OpponentRef,
    pub outcome: Outcome,
}

impl EpisodeReport {
    pub fn is_void(&self) -> bool {
        self.outcome.is_void()
    }
}

impl Episode {
    pub fn new(id: EpisodeId, slot: usize, opponent: OpponentRef, start_tick: u64) -> Self {
        Self {
            id,
            slot,
            opponent,
            start_tick,
            outcome: None,
            reported: false,
        }
    }

    /// Close the episode. The first close wins; later calls are ignored and return false.
    pub fn close(&mut self, outcome: Outcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.outcome = Some(outcome);
        true
    }

    /// Force-close as void (disconnect, shutdown)
    pub fn abort(&mut self) -> bool {
        self.close(Outcome::Aborted)
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.outcome
    }

    pub fn is_closed(&self) -> bool {
        self.outcome.is_some()
    }

    /// Hand out the closed episode's report. Returns `Some` exactly once.
    pub fn take_report(&mut self) -> Option<EpisodeReport> {
        let outcome = self.outcome?;
        if self.reported {
            return None;
        }
        self.reported = true;
        Some(EpisodeReport {
            episode_id: self.id,
            slot: self.slot,
            opponent: self.opponent.clone(),
            outcome,
        })
    }
}
