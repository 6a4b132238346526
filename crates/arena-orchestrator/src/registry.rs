//! Persistent record of running jobs
//!
//! One `{run_dir}/{name}.job.json` per job, rewritten whenever a child's pid
//! changes, so a later `cleanup` can find processes a crashed orchestrator left behind.

use arena_core::snapshot::now_ms;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::OrchestratorError;

const RECORD_SUFFIX: &str = ".job.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub name: String,
    /// None while the child is not running
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub name: String,
    pub started_at_ms: u64,
    pub host: String,
    pub ports: Vec<u16>,
    pub children: Vec<ChildRecord>,
}

impl JobRecord {
    pub fn new(name: impl Into<String>, host: impl Into<String>, ports: Vec<u16>) -> Self {
        Self {
            name: name.into(),
            started_at_ms: now_ms(),
            host: host.into(),
            ports,
            children: Vec::new(),
        }
    }

    pub fn set_pid(&mut self, child: &str, pid: Option<u32>) {
        match self.children.iter_mut().find(|c| c.name == child) {
            Some(record) => record.pid = pid,
            None => self.children.push(ChildRecord {
                name: child.to_string(),
                pid,
            }),
        }
    }

    pub fn pids(&self) -> Vec<u32> {
        self.children.iter().filter_map(|c| c.pid).collect()
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorRegistry {
    run_dir: PathBuf,
}

impl OrchestratorRegistry {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{name}{RECORD_SUFFIX}"))
    }

    /// Write (or overwrite) the record for `record.name`
    pub fn record(&self, record: &JobRecord) -> Result<(), OrchestratorError> {
        fs::create_dir_all(&self.run_dir).map_err(|e| self.io_error(&self.run_dir, e))?;
        let path = self.path_for(&record.name);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_vec_pretty(record).map_err(|e| {
            OrchestratorError::CorruptRecord {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        fs::write(&tmp, data).map_err(|e| self.io_error(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| self.io_error(&path, e))?;
        debug!("Recorded job {} at {:?}", record.name, path);
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Option<JobRecord>, OrchestratorError> {
        let path = self.path_for(name);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(&path, e)),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| OrchestratorError::CorruptRecord {
                path,
                reason: e.to_string(),
            })
    }

    /// Returns whether a record existed
    pub fn remove(&self, name: &str) -> Result<bool, OrchestratorError> {
        let path = self.path_for(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.io_error(&path, e)),
        }
    }

    /// Names of recorded jobs, sorted
    pub fn list(&self) -> Result<Vec<String>, OrchestratorError> {
        let entries = match fs::read_dir(&self.run_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(&self.run_dir, e)),
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .strip_suffix(RECORD_SUFFIX)
                    .map(str::to_string)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> OrchestratorError {
        OrchestratorError::Registry {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_load_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = OrchestratorRegistry::new(dir.path().join("run"));

        assert!(registry.load("pvp").unwrap().is_none());
        assert!(registry.list().unwrap().is_empty());

        let mut record = JobRecord::new("pvp", "127.0.0.1", vec![7070, 9999]);
        record.set_pid("simulation", Some(1234));
        record.set_pid("trainer-0", Some(1240));
        record.set_pid("simulation", Some(1250));
        registry.record(&record).unwrap();

        let loaded = registry.load("pvp").unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.pids(), vec![1250, 1240]);
        assert_eq!(registry.list().unwrap(), vec!["pvp"]);

        assert!(registry.remove("pvp").unwrap());
        assert!(!registry.remove("pvp").unwrap());
        assert!(registry.load("pvp").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let registry = OrchestratorRegistry::new(dir.path());
        fs::write(registry.path_for("broken"), b"{").unwrap();

        assert!(matches!(
            registry.load("broken"),
            Err(OrchestratorError::CorruptRecord { .. })
        ));
    }
}
