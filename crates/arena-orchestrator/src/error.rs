//! Orchestrator error types

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// A child that exited unsuccessfully and was not (or no longer) restarted
#[derive(Debug, Clone, PartialEq)]
pub struct ChildCrash {
    pub child: String,
    /// None when the process was killed by a signal or never started
    pub exit_code: Option<i32>,
    pub restarts: u32,
    /// Last lines the child logged before exiting
    pub recent_logs: Vec<String>,
}

impl fmt::Display for ChildCrash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{} exited with code {}", self.child, code)?,
            None => write!(f, "{} terminated abnormally", self.child)?,
        }
        if self.restarts > 0 {
            write!(f, " after {} restarts", self.restarts)?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Child crashed: {0}")]
    ChildCrash(ChildCrash),

    #[error("Failed to spawn {child}: {source}")]
    Spawn {
        child: String,
        source: std::io::Error,
    },

    #[error("Invalid job spec: {0}")]
    InvalidSpec(String),

    #[error("Job {0} is already running")]
    AlreadyRunning(String),

    #[error("Registry I/O error at {path}: {source}")]
    Registry {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Corrupt registry record {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("Ports still in use after cleanup: {0:?}")]
    PortsBusy(Vec<u16>),

    #[error("Supervisor task failed: {0}")]
    Supervisor(String),
}
