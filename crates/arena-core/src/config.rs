//! Configuration, loadable from TOML with `ARENA_*` environment overrides

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::elo::EloConfig;
use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArenaConfig {
    pub ports: PortConfig,
    pub session: SessionConfig,
    pub pool: PoolConfig,
    pub elo: EloConfig,
    pub opponents: OpponentConfig,
    pub checkpoint: CheckpointConfig,
    pub inference: InferenceConfig,
    pub simulation: SimulationEnv,
}

/// Network endpoints. Every port is independently configurable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Host the simulation and inference server listen on
    pub host: String,
    /// Training bridge (simulation side of the session protocol)
    pub training_bridge: u16,
    /// Game client port; used by the simulation only
    pub game_client: u16,
    pub inference: u16,
    pub metrics_dashboard: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            training_bridge: 7070,
            game_client: 43595,
            inference: 9999,
            metrics_dashboard: 6006,
        }
    }
}

impl PortConfig {
    pub fn training_address(&self) -> String {
        format!("{}:{}", self.host, self.training_bridge)
    }

    pub fn inference_address(&self) -> String {
        format!("{}:{}", self.host, self.inference)
    }

    /// Ports bound by the simulation a job runs. The inference server and the
    /// dashboard are separate processes and outlive any job.
    pub fn job_ports(&self) -> Vec<u16> {
        vec![self.training_bridge, self.game_client]
    }
}

/// Session connector timeouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_ms: u64,
    /// Bound on every read and write of one record
    pub io_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            io_timeout_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

/// Environment pool sizing and failure isolation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of concurrent matches (N)
    pub num_envs: usize,
    /// Failures since the last successful reset before a slot is reconnected
    pub max_failures_before_reset: u32,
    /// Action heads; used to size no-op actions
    pub num_action_heads: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_envs: 4,
            max_failures_before_reset: 1,
            num_action_heads: 1,
        }
    }
}

/// How the opponent pool picks an opponent
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SamplingStrategy {
    /// Every retained entry equally likely
    Uniform,
    /// Weight `1 / (1 + |rating gap| / scale)` against the agent's live rating
    RatingWeighted { scale: f64 },
    /// Always the newest entry
    Latest,
}

impl Default for SamplingStrategy {
    fn default() -> Self {
        SamplingStrategy::RatingWeighted { scale: 100.0 }
    }
}

/// Which entries survive `prune`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Pool capacity
    pub max_entries: usize,
    /// Highest-rated entries that are never evicted
    pub keep_top_rated: usize,
    /// Newest entries that are never evicted (at least one always is)
    pub keep_recent: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_entries: 20,
            keep_top_rated: 5,
            keep_recent: 5,
        }
    }
}

/// Self-play opponent selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpponentConfig {
    pub strategy: SamplingStrategy,
    pub retention: RetentionPolicy,
    /// Fraction of episodes played against scripted bots instead of snapshots
    pub scripted_fraction: f64,
    /// Scripted bots the simulation provides
    pub scripted_opponents: Vec<String>,
}

impl Default for OpponentConfig {
    fn default() -> Self {
        Self {
            strategy: SamplingStrategy::default(),
            retention: RetentionPolicy::default(),
            scripted_fraction: 0.2,
            scripted_opponents: vec!["nh_baseline".into()],
        }
    }
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

/// Snapshot cadence and storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    pub dir: PathBuf,
    /// Training steps between snapshots
    pub cadence_steps: u64,
    pub retry: RetryPolicy,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("checkpoints"),
            cadence_steps: 50_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Inference server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Where named models are looked up
    pub models_dir: PathBuf,
    /// Resident models before the least recently used one is evicted
    pub max_loaded_models: usize,
    /// Seed for stochastic requests that do not carry one
    pub default_seed: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("checkpoints"),
            max_loaded_models: 8,
            default_seed: 0,
        }
    }
}

/// Flags the simulation process reads from its environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationEnv {
    pub enable_training: bool,
    pub enable_eval_bots: bool,
    /// Simulation waits for every session's action before advancing a tick
    pub sync_training: bool,
    pub tick_rate_ms: u64,
}

impl Default for SimulationEnv {
    fn default() -> Self {
        Self {
            enable_training: true,
            enable_eval_bots: false,
            sync_training: true,
            tick_rate_ms: 600,
        }
    }
}

impl ArenaConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: ArenaConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration, falling back to defaults if the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply `ARENA_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `ARENA_*` overrides from an arbitrary lookup
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("ARENA_HOST") {
            self.ports.host = host;
        }
        if let Some(v) = lookup("ARENA_TRAINING_PORT") {
            self.ports.training_bridge = parse_field("ARENA_TRAINING_PORT", &v)?;
        }
        if let Some(v) = lookup("ARENA_INFERENCE_PORT") {
            self.ports.inference = parse_field("ARENA_INFERENCE_PORT", &v)?;
        }
        if let Some(v) = lookup("ARENA_NUM_ENVS") {
            self.pool.num_envs = parse_field("ARENA_NUM_ENVS", &v)?;
        }
        if let Some(dir) = lookup("ARENA_CHECKPOINT_DIR") {
            self.checkpoint.dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("ARENA_MODELS_DIR") {
            self.inference.models_dir = PathBuf::from(dir);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.num_envs == 0 {
            return Err(invalid("pool.num_envs", "must be at least 1"));
        }
        if self.pool.max_failures_before_reset == 0 {
            return Err(invalid("pool.max_failures_before_reset", "must be at least 1"));
        }
        if self.elo.k_factor <= 0.0 {
            return Err(invalid("elo.k_factor", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.opponents.scripted_fraction) {
            return Err(invalid("opponents.scripted_fraction", "must be within [0, 1]"));
        }
        if self.opponents.scripted_fraction > 0.0 && self.opponents.scripted_opponents.is_empty() {
            return Err(invalid(
                "opponents.scripted_opponents",
                "required when scripted_fraction > 0",
            ));
        }
        if let SamplingStrategy::RatingWeighted { scale } = self.opponents.strategy {
            if scale <= 0.0 {
                return Err(invalid("opponents.strategy.scale", "must be positive"));
            }
        }
        if self.opponents.retention.max_entries == 0 {
            return Err(invalid("opponents.retention.max_entries", "must be at least 1"));
        }
        if self.checkpoint.cadence_steps == 0 {
            return Err(invalid("checkpoint.cadence_steps", "must be at least 1"));
        }
        if self.checkpoint.retry.max_attempts == 0 {
            return Err(invalid("checkpoint.retry.max_attempts", "must be at least 1"));
        }
        if self.inference.max_loaded_models == 0 {
            return Err(invalid("inference.max_loaded_models", "must be at least 1"));
        }
        if self.session.io_timeout_ms == 0 {
            return Err(invalid("session.io_timeout_ms", "must be positive"));
        }
        Ok(())
    }

    /// Environment variables handed to the simulation process
    pub fn simulation_env(&self) -> BTreeMap<String, String> {
        let sim = &self.simulation;
        BTreeMap::from([
            ("ENABLE_TRAINING".to_string(), sim.enable_training.to_string()),
            ("ENABLE_EVAL_BOTS".to_string(), sim.enable_eval_bots.to_string()),
            ("SYNC_TRAINING".to_string(), sim.sync_training.to_string()),
            ("TICK_RATE_MS".to_string(), sim.tick_rate_ms.to_string()),
            ("INFERENCE_HOST".to_string(), self.ports.host.clone()),
            ("INFERENCE_PORT".to_string(), self.ports.inference.to_string()),
            (
                "TRAINING_BRIDGE_PORT".to_string(),
                self.ports.training_bridge.to_string(),
            ),
        ])
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

fn parse_field<T: std::str::FromStr>(field: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| invalid(field, &format!("cannot parse {value:?}")))
}
