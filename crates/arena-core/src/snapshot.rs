//! Versioned policy snapshots

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::policy::LinearHead;

/// Monotonically increasing snapshot identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotVersion(pub u64);

impl SnapshotVersion {
    pub fn next(self) -> Self {
        SnapshotVersion(self.0 + 1)
    }

    /// Checkpoint file name for this version
    pub fn file_name(self) -> String {
        format!("snapshot_{:06}.json", self.0)
    }

    /// Parse a version back out of a checkpoint file name
    pub fn from_file_name(name: &str) -> Option<Self> {
        name.strip_prefix("snapshot_")?
            .strip_suffix(".json")?
            .parse()
            .ok()
            .map(SnapshotVersion)
    }
}

impl fmt::Display for SnapshotVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Serialized parameters of a multi-head linear policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyParameters {
    /// Length of the observation feature vector
    pub input_dim: usize,
    /// One linear layer per action head
    pub heads: Vec<LinearHead>,
    /// Optional single-output value head
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<LinearHead>,
}

impl PolicyParameters {
    /// Hex SHA-256 over the canonical JSON encoding
    pub fn checksum(&self) -> String {
        // Serializing plain numbers and vectors cannot fail.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Number of choices per head
    pub fn head_sizes(&self) -> Vec<usize> {
        self.heads.iter().map(LinearHead::outputs).collect()
    }
}

/// Immutable, named, versioned set of policy parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicySnapshot {
    pub version: SnapshotVersion,
    /// Training step the parameters were taken at
    pub step: u64,
    /// Creation time, unix milliseconds
    pub created_at_ms: u64,
    /// Hex SHA-256 of `parameters`
    pub checksum: String,
    pub parameters: PolicyParameters,
}

impl PolicySnapshot {
    pub fn new(version: SnapshotVersion, step: u64, parameters: PolicyParameters) -> Self {
        Self {
            version,
            step,
            created_at_ms: now_ms(),
            checksum: parameters.checksum(),
            parameters,
        }
    }

    /// Whether the stored checksum matches the parameters
    pub fn verify(&self) -> bool {
        self.checksum == self.parameters.checksum()
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
