//! Resident snapshots with least-recently-used eviction

use arena_core::{LinearPolicy, SnapshotVersion};
use arena_selfplay::{list_versions, read_snapshot};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::InferError;

/// Alias resolving to the highest snapshot version on disk
pub const LATEST: &str = "latest";

/// A snapshot loaded for serving
#[derive(Debug)]
pub struct LoadedModel {
    /// File stem the model was loaded from
    pub name: String,
    pub version: SnapshotVersion,
    pub step: u64,
    pub policy: LinearPolicy,
}

pub struct ModelCache {
    models_dir: PathBuf,
    capacity: usize,
    /// Front is most recently used
    entries: VecDeque<Arc<LoadedModel>>,
}

impl ModelCache {
    pub fn new(models_dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            models_dir: models_dir.into(),
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of resident models, most recently used first
    pub fn loaded(&self) -> Vec<String> {
        self.entries.iter().map(|m| m.name.clone()).collect()
    }

    /// Map a request name to a snapshot file stem. `latest` is re-resolved on every call.
    pub fn resolve(&self, name: &str) -> Result<String, InferError> {
        resolve_model(&self.models_dir, name)
    }

    /// A resident model, marked as most recently used
    pub fn touch(&mut self, stem: &str) -> Option<Arc<LoadedModel>> {
        let pos = self.entries.iter().position(|m| m.name == stem)?;
        let model = self.entries.remove(pos)?;
        self.entries.push_front(model.clone());
        Some(model)
    }

    /// Make `model` resident, evicting the least recently used entry when full.
    /// A copy loaded concurrently under the same name wins over `model`.
    pub fn insert(&mut self, model: Arc<LoadedModel>) -> Arc<LoadedModel> {
        if let Some(existing) = self.touch(&model.name) {
            return existing;
        }
        if self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop_back() {
                debug!("Evicting model {} ({})", evicted.name, evicted.version);
            }
        }
        self.entries.push_front(model.clone());
        model
    }

    /// Fetch a resident model, loading it on first use
    pub fn get(&mut self, name: &str) -> Result<Arc<LoadedModel>, InferError> {
        let stem = self.resolve(name)?;
        if let Some(model) = self.touch(&stem) {
            return Ok(model);
        }
        let model = load_model(&self.models_dir, &stem)?;
        Ok(self.insert(Arc::new(model)))
    }

    /// Drop a resident model. Returns whether it was loaded.
    pub fn unload(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|m| m.name != name);
        before != self.entries.len()
    }
}

/// Map a request name to a snapshot file stem in `models_dir`. Anything that is
/// not `latest` or a snapshot name is unknown.
pub fn resolve_model(models_dir: &Path, name: &str) -> Result<String, InferError> {
    let version = if name == LATEST {
        list_versions(models_dir)?.last().copied()
    } else {
        SnapshotVersion::from_file_name(&format!("{name}.json"))
    };
    version
        .map(|v| file_stem(&v.file_name()))
        .ok_or_else(|| InferError::UnknownModel(name.to_string()))
}

/// Read and verify one snapshot. Blocking.
pub fn load_model(models_dir: &Path, stem: &str) -> Result<LoadedModel, InferError> {
    let path = models_dir.join(format!("{stem}.json"));
    if !path.is_file() {
        return Err(InferError::UnknownModel(stem.to_string()));
    }
    let snapshot = read_snapshot(&path)?;
    let policy = LinearPolicy::new(snapshot.parameters)?;
    info!(
        "Loaded model {} ({}, step {}) from {:?}",
        stem, snapshot.version, snapshot.step, path
    );
    Ok(LoadedModel {
        name: stem.to_string(),
        version: snapshot.version,
        step: snapshot.step,
        policy,
    })
}

fn file_stem(file_name: &str) -> String {
    file_name.strip_suffix(".json").unwrap_or(file_name).to_string()
}
