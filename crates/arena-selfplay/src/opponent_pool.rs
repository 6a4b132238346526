//! Opponent pool for self-play
//!
//! Past policy snapshots the agent trains against, each with its own Elo rating.
//! Opponents are sampled by rating proximity to the agent, so the agent mostly
//! meets snapshots near its own strength.
//!
//! Key features:
//! - Uniform, rating-weighted and latest-only sampling
//! - Zero-sum rating updates through the Elo tracker
//! - Retention that keeps the newest and the strongest snapshots
//! - Persistence in `pool.json` next to the checkpoints

use arena_core::config::{RetentionPolicy, SamplingStrategy};
use arena_core::{EloConfig, EloError, EloTracker, Outcome, PolicySnapshot, SnapshotVersion};
use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::storage::write_atomic;

/// File the pool state is persisted in, inside the checkpoint directory
pub const POOL_FILE: &str = "pool.json";

#[derive(Debug, Error)]
pub enum OpponentPoolError {
    #[error("Opponent pool is empty")]
    Empty,

    #[error("No pool entry for snapshot {0}")]
    UnknownEntry(SnapshotVersion),

    #[error("Snapshot {0} is already registered")]
    Duplicate(SnapshotVersion),

    #[error(transparent)]
    Rating(#[from] EloError),

    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed pool file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// A rated snapshot available as an opponent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpponentPoolEntry {
    pub version: SnapshotVersion,
    /// Training step the snapshot was taken at
    pub step: u64,
    /// Checkpoint file name, relative to the checkpoint directory
    pub file: String,
    pub rating: f64,
    #[serde(default)]
    pub games_played: u64,
}

/// Ratings before and after one reported game
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatingUpdate {
    pub version: SnapshotVersion,
    pub outcome: Outcome,
    pub agent_before: f64,
    pub agent_after: f64,
    pub entry_before: f64,
    pub entry_after: f64,
}

/// Persisted pool state (`pool.json`)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PoolFile {
    agent_rating: f64,
    entries: Vec<OpponentPoolEntry>,
}

/// Rated opponent snapshots plus the live agent's rating
pub struct OpponentPool {
    /// Ordered by version, oldest first
    entries: Vec<OpponentPoolEntry>,
    agent_rating: f64,
    elo: EloTracker,
    retention: RetentionPolicy,
    rng: ChaCha8Rng,
}

impl OpponentPool {
    pub fn new(elo: EloConfig, retention: RetentionPolicy, seed: u64) -> Self {
        Self {
            entries: Vec::new(),
            agent_rating: elo.initial_rating,
            elo: EloTracker::new(elo),
            retention,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn agent_rating(&self) -> f64 {
        self.agent_rating
    }

    pub fn entries(&self) -> &[OpponentPoolEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, version: SnapshotVersion) -> Option<&OpponentPoolEntry> {
        self.entries.iter().find(|e| e.version == version)
    }

    /// Newest entry
    pub fn latest(&self) -> Option<&OpponentPoolEntry> {
        self.entries.last()
    }

    /// Add a snapshot with a starting rating
    pub fn register(
        &mut self,
        snapshot: &PolicySnapshot,
        initial_rating: f64,
    ) -> Result<&OpponentPoolEntry, OpponentPoolError> {
        if self.get(snapshot.version).is_some() {
            return Err(OpponentPoolError::Duplicate(snapshot.version));
        }
        let entry = OpponentPoolEntry {
            version: snapshot.version,
            step: snapshot.step,
            file: snapshot.version.file_name(),
            rating: initial_rating,
            games_played: 0,
        };
        let pos = self
            .entries
            .partition_point(|e| e.version < snapshot.version);
        self.entries.insert(pos, entry);
        info!(
            version = %snapshot.version,
            rating = initial_rating,
            size = self.entries.len(),
            "Registered opponent"
        );
        Ok(&self.entries[pos])
    }

    /// Sampling weight of every entry under `strategy`, in entry order
    pub fn weights(&self, strategy: SamplingStrategy) -> Vec<f64> {
        let n = self.entries.len();
        match strategy {
            SamplingStrategy::Uniform => vec![1.0; n],
            SamplingStrategy::Latest => (0..n).map(|i| if i + 1 == n { 1.0 } else { 0.0 }).collect(),
            SamplingStrategy::RatingWeighted { scale } => self
                .entries
                .iter()
                .map(|e| 1.0 / (1.0 + (e.rating - self.agent_rating).abs() / scale))
                .collect(),
        }
    }

    /// Pick an opponent
    pub fn sample(
        &mut self,
        strategy: SamplingStrategy,
    ) -> Result<OpponentPoolEntry, OpponentPoolError> {
        if self.entries.is_empty() {
            return Err(OpponentPoolError::Empty);
        }
        let index = match strategy {
            SamplingStrategy::Latest => self.entries.len() - 1,
            SamplingStrategy::Uniform => self.rng.gen_range(0..self.entries.len()),
            SamplingStrategy::RatingWeighted { .. } => {
                match WeightedIndex::new(self.weights(strategy)) {
                    Ok(dist) => dist.sample(&mut self.rng),
                    Err(e) => {
                        warn!("Degenerate sampling weights ({}), falling back to uniform", e);
                        self.rng.gen_range(0..self.entries.len())
                    }
                }
            }
        };
        Ok(self.entries[index].clone())
    }

    /// Apply one game result, `outcome` from the agent's side. Void outcomes are
    /// ignored and return `None`.
    pub fn report_outcome(
        &mut self,
        version: SnapshotVersion,
        outcome: Outcome,
    ) -> Result<Option<RatingUpdate>, OpponentPoolError> {
        if outcome.is_void() {
            debug!(version = %version, "Void outcome, ratings unchanged");
            return Ok(None);
        }
        let agent_before = self.agent_rating;
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.version == version)
            .ok_or(OpponentPoolError::UnknownEntry(version))?;

        let entry_before = entry.rating;
        let (agent_after, entry_after) = self.elo.update(agent_before, entry_before, outcome)?;
        entry.rating = entry_after;
        entry.games_played += 1;
        self.agent_rating = agent_after;

        debug!(
            version = %version,
            ?outcome,
            agent = agent_after,
            opponent = entry_after,
            "Ratings updated"
        );
        Ok(Some(RatingUpdate {
            version,
            outcome,
            agent_before,
            agent_after,
            entry_before,
            entry_after,
        }))
    }

    /// Evict entries until the pool fits `max_entries`. The newest
    /// `max(keep_recent, 1)` entries and the `keep_top_rated` highest-rated ones
    /// are protected. Among the rest, the entry with the lowest combined rating
    /// and recency rank goes first, older first on ties.
    pub fn prune(&mut self) -> Vec<OpponentPoolEntry> {
        let mut evicted = Vec::new();
        while self.entries.len() > self.retention.max_entries {
            let Some(victim) = self.eviction_candidate() else {
                warn!(
                    size = self.entries.len(),
                    max = self.retention.max_entries,
                    "Every entry is protected; pool stays over capacity"
                );
                break;
            };
            let entry = self.entries.remove(victim);
            info!(version = %entry.version, rating = entry.rating, "Evicted opponent");
            evicted.push(entry);
        }
        evicted
    }

    fn eviction_candidate(&self) -> Option<usize> {
        let n = self.entries.len();
        let keep_recent = self.retention.keep_recent.max(1);

        // Indices by rating, strongest first; ties favour the newer entry
        let mut by_rating: Vec<usize> = (0..n).collect();
        by_rating.sort_by(|&a, &b| {
            self.entries[b]
                .rating
                .partial_cmp(&self.entries[a].rating)
                .unwrap_or(Ordering::Equal)
                .then(b.cmp(&a))
        });

        let mut protected = vec![false; n];
        for p in protected.iter_mut().skip(n.saturating_sub(keep_recent)) {
            *p = true;
        }
        for &i in by_rating.iter().take(self.retention.keep_top_rated) {
            protected[i] = true;
        }

        // rating_rank: 0 for the weakest
        let mut rating_rank = vec![0usize; n];
        for (rank, &i) in by_rating.iter().rev().enumerate() {
            rating_rank[i] = rank;
        }

        (0..n)
            .filter(|&i| !protected[i])
            .min_by_key(|&i| (rating_rank[i] + i, i))
    }

    /// Persist ratings and entries to `path` atomically
    pub fn save(&self, path: &Path) -> Result<(), OpponentPoolError> {
        let file = PoolFile {
            agent_rating: self.agent_rating,
            entries: self.entries.clone(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|e| OpponentPoolError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        write_atomic(path, &json).map_err(|e| OpponentPoolError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Restore a pool saved with `save`. A missing file yields an empty pool.
    pub fn load_or_new(
        path: &Path,
        elo: EloConfig,
        retention: RetentionPolicy,
        seed: u64,
    ) -> Result<Self, OpponentPoolError> {
        let mut pool = Self::new(elo, retention, seed);
        if !path.exists() {
            return Ok(pool);
        }
        let json = std::fs::read(path).map_err(|e| OpponentPoolError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let file: PoolFile = serde_json::from_slice(&json).map_err(|e| OpponentPoolError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        pool.agent_rating = file.agent_rating;
        pool.entries = file.entries;
        pool.entries.sort_by_key(|e| e.version);
        info!(
            entries = pool.entries.len(),
            agent_rating = pool.agent_rating,
            "Restored opponent pool from {}",
            path.display()
        );
        Ok(pool)
    }
}

/// Pool handle shared between episode reporters and the checkpoint writer.
/// The mutex is the single serialization point for rating updates.
#[derive(Clone)]
pub struct SharedOpponentPool {
    inner: Arc<Mutex<OpponentPool>>,
}

impl SharedOpponentPool {
    pub fn new(pool: OpponentPool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(pool)),
        }
    }

    /// Exclusive access for multi-step operations
    pub async fn lock(&self) -> MutexGuard<'_, OpponentPool> {
        self.inner.lock().await
    }

    pub async fn sample(
        &self,
        strategy: SamplingStrategy,
    ) -> Result<OpponentPoolEntry, OpponentPoolError> {
        self.inner.lock().await.sample(strategy)
    }

    pub async fn report_outcome(
        &self,
        version: SnapshotVersion,
        outcome: Outcome,
    ) -> Result<Option<RatingUpdate>, OpponentPoolError> {
        self.inner.lock().await.report_outcome(version, outcome)
    }

    pub async fn agent_rating(&self) -> f64 {
        self.inner.lock().await.agent_rating()
    }

    pub async fn entries(&self) -> Vec<OpponentPoolEntry> {
        self.inner.lock().await.entries().to_vec()
    }
}
