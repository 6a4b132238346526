//! Checkpoint manager
//!
//! Snapshots the trainer's policy on a step cadence, writes each snapshot
//! atomically, and feeds it into the opponent pool.

use arena_core::config::{CheckpointConfig, RetryPolicy};
use arena_core::{PolicyParameters, PolicySnapshot, SnapshotVersion};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::opponent_pool::{OpponentPoolError, POOL_FILE, SharedOpponentPool};
use crate::storage::write_atomic;

#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Retries exhausted; fatal for this tick only
    #[error("Failed to write snapshot {version} after {attempts} attempts: {source}")]
    WriteFailure {
        version: SnapshotVersion,
        attempts: u32,
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt checkpoint {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("No checkpoint for snapshot {0}")]
    NotFound(SnapshotVersion),

    #[error(transparent)]
    Pool(#[from] OpponentPoolError),
}

/// Read and verify one snapshot file
pub fn read_snapshot(path: &Path) -> Result<PolicySnapshot, CheckpointError> {
    let data = fs::read(path).map_err(|e| CheckpointError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let snapshot: PolicySnapshot =
        serde_json::from_slice(&data).map_err(|e| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if !snapshot.verify() {
        return Err(CheckpointError::Corrupt {
            path: path.to_path_buf(),
            reason: "checksum mismatch".into(),
        });
    }
    Ok(snapshot)
}

/// Snapshot versions present in `dir`, ascending. Staged `.tmp` files are skipped.
pub fn list_versions(dir: &Path) -> Result<Vec<SnapshotVersion>, CheckpointError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CheckpointError::Io {
                path: dir.to_path_buf(),
                source: e,
            });
        }
    };
    let mut versions: Vec<SnapshotVersion> = entries
        .flatten()
        .filter_map(|entry| SnapshotVersion::from_file_name(&entry.file_name().to_string_lossy()))
        .collect();
    versions.sort();
    Ok(versions)
}

/// Writes snapshots and registers them as opponents
pub struct CheckpointManager {
    dir: PathBuf,
    cadence_steps: u64,
    retry: RetryPolicy,
    last_snapshot_step: u64,
    next_version: SnapshotVersion,
    pool: SharedOpponentPool,
}

impl CheckpointManager {
    /// Open `config.dir`, creating it if needed, and continue numbering after
    /// the highest version already present
    pub fn new(config: &CheckpointConfig, pool: SharedOpponentPool) -> Result<Self, CheckpointError> {
        fs::create_dir_all(&config.dir).map_err(|e| CheckpointError::Io {
            path: config.dir.clone(),
            source: e,
        })?;
        let latest = list_versions(&config.dir)?.last().copied();
        let next_version = latest.map_or(SnapshotVersion(1), SnapshotVersion::next);
        debug!(dir = %config.dir.display(), next = %next_version, "Checkpoint manager ready");

        Ok(Self {
            dir: config.dir.clone(),
            cadence_steps: config.cadence_steps,
            retry: config.retry,
            last_snapshot_step: 0,
            next_version,
            pool,
        })
    }

    /// Resume the cadence from a known step
    pub fn with_last_snapshot_step(mut self, step: u64) -> Self {
        self.last_snapshot_step = step;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, version: SnapshotVersion) -> PathBuf {
        self.dir.join(version.file_name())
    }

    pub fn pool_path(&self) -> PathBuf {
        self.dir.join(POOL_FILE)
    }

    pub fn is_due(&self, step: u64) -> bool {
        step.saturating_sub(self.last_snapshot_step) >= self.cadence_steps
    }

    /// Snapshot if `cadence_steps` have passed since the last one
    pub async fn maybe_snapshot(
        &mut self,
        step: u64,
        parameters: &PolicyParameters,
    ) -> Result<Option<PolicySnapshot>, CheckpointError> {
        if !self.is_due(step) {
            return Ok(None);
        }
        // The cadence restarts even on failure so a broken disk is not hammered every tick
        self.last_snapshot_step = step;
        self.snapshot(step, parameters.clone()).await.map(Some)
    }

    /// Write a snapshot now and register it in the opponent pool
    pub async fn snapshot(
        &mut self,
        step: u64,
        parameters: PolicyParameters,
    ) -> Result<PolicySnapshot, CheckpointError> {
        let snapshot = PolicySnapshot::new(self.next_version, step, parameters);
        self.write_with_retry(&snapshot).await?;
        self.next_version = snapshot.version.next();

        let (evicted, pool_result) = {
            let mut pool = self.pool.lock().await;
            let rating = pool.agent_rating();
            pool.register(&snapshot, rating)?;
            let evicted = pool.prune();
            let result = pool.save(&self.pool_path());
            (evicted, result)
        };

        for entry in &evicted {
            let path = self.dir.join(&entry.file);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to remove evicted checkpoint {}: {}", path.display(), e);
            }
        }
        if let Err(e) = pool_result {
            warn!("Failed to persist opponent pool: {}", e);
        }

        info!(
            version = %snapshot.version,
            step,
            evicted = evicted.len(),
            "Snapshot written"
        );
        Ok(snapshot)
    }

    async fn write_with_retry(&self, snapshot: &PolicySnapshot) -> Result<(), CheckpointError> {
        let path = self.path_for(snapshot.version);
        let data = serde_json::to_vec(snapshot).map_err(|e| CheckpointError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        let mut attempt = 1;
        loop {
            let target = path.clone();
            let bytes = data.clone();
            let result = tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
                .await
                .unwrap_or_else(|e| Err(std::io::Error::other(e)));

            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.retry.max_attempts => {
                    return Err(CheckpointError::WriteFailure {
                        version: snapshot.version,
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        version = %snapshot.version,
                        attempt,
                        "Snapshot write failed ({}), retrying in {:?}",
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Load and verify a snapshot by version
    pub fn load(&self, version: SnapshotVersion) -> Result<PolicySnapshot, CheckpointError> {
        let path = self.path_for(version);
        if !path.exists() {
            return Err(CheckpointError::NotFound(version));
        }
        let snapshot = read_snapshot(&path)?;
        if snapshot.version != version {
            return Err(CheckpointError::Corrupt {
                path,
                reason: format!("file holds {}", snapshot.version),
            });
        }
        Ok(snapshot)
    }

    pub fn list(&self) -> Result<Vec<SnapshotVersion>, CheckpointError> {
        list_versions(&self.dir)
    }
}
