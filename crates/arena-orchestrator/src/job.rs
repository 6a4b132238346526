//! Job and child process descriptions

use arena_core::ArenaConfig;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::OrchestratorError;
use crate::supervision::SupervisionPolicy;

/// One process of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Added on top of the job environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl ChildSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// A simulation plus its trainers, started and stopped together
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    /// Host the job's ports are bound on
    pub host: String,
    /// Ports that must be free again after the job stops
    pub ports: Vec<u16>,
    /// Environment shared by every child
    pub env: BTreeMap<String, String>,
    pub children: Vec<ChildSpec>,
    pub supervision: SupervisionPolicy,
    /// Between TERM and KILL
    pub stop_grace: Duration,
    /// How long teardown waits for the ports
    pub port_release_timeout: Duration,
}

impl JobSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: "127.0.0.1".into(),
            ports: Vec::new(),
            env: BTreeMap::new(),
            children: Vec::new(),
            supervision: SupervisionPolicy::default(),
            stop_grace: Duration::from_secs(5),
            port_release_timeout: Duration::from_secs(10),
        }
    }

    /// Job wired to the simulation settings and ports of `config`
    pub fn from_config(name: impl Into<String>, config: &ArenaConfig) -> Self {
        Self {
            host: config.ports.host.clone(),
            ports: config.ports.job_ports(),
            env: config.simulation_env(),
            ..Self::new(name)
        }
    }

    pub fn child(mut self, child: ChildSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn supervision(mut self, policy: SupervisionPolicy) -> Self {
        self.supervision = policy;
        self
    }

    pub fn stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Environment for one child: job variables, then the child's own
    pub fn env_for(&self, child: &ChildSpec) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        env.extend(child.env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.name.is_empty() || self.name.contains(['/', '\\']) || self.name.starts_with('.') {
            return Err(OrchestratorError::InvalidSpec(format!(
                "invalid job name {:?}",
                self.name
            )));
        }
        if self.children.is_empty() {
            return Err(OrchestratorError::InvalidSpec("job has no children".into()));
        }
        let mut seen = HashSet::new();
        for child in &self.children {
            if child.program.is_empty() {
                return Err(OrchestratorError::InvalidSpec(format!(
                    "child {} has no program",
                    child.name
                )));
            }
            if !seen.insert(child.name.as_str()) {
                return Err(OrchestratorError::InvalidSpec(format!(
                    "duplicate child name {}",
                    child.name
                )));
            }
        }
        Ok(())
    }
}
