//! Self-play training loop
//!
//! Each tick runs an ordered list of stages against a fresh `TickContext`:
//!
//! 1. `Act`: the learner picks an action per slot
//! 2. `Step`: the environment pool steps every match and the learner consumes the batch
//! 3. `Rate`: closed episodes update Elo ratings through the opponent pool
//! 4. `Reset`: failed and finished slots get a new opponent and a new episode
//! 5. `Checkpoint`: the learner's parameters are snapshotted on cadence
//!
//! A stage reads what earlier stages wrote and writes only its own output.

use arena_core::config::{ArenaConfig, OpponentConfig};
use arena_core::{
    Action, EpisodeReport, LinearPolicy, Observation, OpponentRef, Policy, PolicyParameters, PolicySnapshot,
    ResetConfig, Sampling, TaskKind, Transition,
};
use arena_env::{EnvironmentPool, PoolError};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::opponent_pool::{OpponentPoolError, RatingUpdate, SharedOpponentPool};

#[derive(Debug, Error)]
pub enum SelfPlayError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("No opponent available: pool is empty and no scripted opponents are configured")]
    NoOpponent,
}

/// The trainer side of the loop. Gradient computation lives behind this trait.
pub trait Learner: Send {
    /// One action per slot, in slot order
    fn act(&mut self, observations: &[Observation]) -> Vec<Action>;

    /// Consume one batch of transitions. Dropped transitions must be masked out.
    fn learn(&mut self, _transitions: &[Transition]) {}

    /// Current parameters, for snapshots
    fn parameters(&self) -> PolicyParameters;
}

/// Learner that plays a fixed policy without updating it
pub struct PolicyLearner {
    policy: LinearPolicy,
    rng: ChaCha8Rng,
    deterministic: bool,
}

impl PolicyLearner {
    pub fn new(policy: LinearPolicy, seed: u64, deterministic: bool) -> Self {
        Self {
            policy,
            rng: ChaCha8Rng::seed_from_u64(seed),
            deterministic,
        }
    }
}

impl Learner for PolicyLearner {
    fn act(&mut self, observations: &[Observation]) -> Vec<Action> {
        let num_heads = self.policy.num_heads();
        observations
            .iter()
            .map(|obs| {
                if obs.features.is_empty() {
                    return Action::noop(num_heads);
                }
                let sampling = if self.deterministic {
                    Sampling::Deterministic
                } else {
                    Sampling::Stochastic(&mut self.rng)
                };
                match self.policy.act(&obs.features, &obs.action_masks, sampling) {
                    Ok(output) => output.action,
                    Err(e) => {
                        debug!("Policy could not act ({}), sending no-op", e);
                        Action::noop(num_heads)
                    }
                }
            })
            .collect()
    }

    fn parameters(&self) -> PolicyParameters {
        self.policy.parameters().clone()
    }
}

/// Loop settings
#[derive(Debug, Clone)]
pub struct SelfPlayConfig {
    pub task: TaskKind,
    pub opponents: OpponentConfig,
    pub seed: u64,
}

impl SelfPlayConfig {
    pub fn from_arena(config: &ArenaConfig, task: TaskKind, seed: u64) -> Self {
        Self {
            task,
            opponents: config.opponents.clone(),
            seed,
        }
    }
}

/// One step of the per-tick pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Act,
    Step,
    Rate,
    Reset,
    Checkpoint,
}

impl Stage {
    pub const DEFAULT_ORDER: [Stage; 5] = [
        Stage::Act,
        Stage::Step,
        Stage::Rate,
        Stage::Reset,
        Stage::Checkpoint,
    ];
}

/// Everything one tick produced, one field per stage
#[derive(Debug, Default)]
pub struct TickContext {
    pub tick: u64,
    /// Environment steps taken before this tick
    pub steps_before: u64,
    /// `Act`
    pub actions: Vec<Action>,
    /// `Step`
    pub transitions: Vec<Transition>,
    /// `Rate`
    pub rating_updates: Vec<RatingUpdate>,
    /// `Rate`: episodes closed as void this tick
    pub void_episodes: usize,
    /// `Reset`
    pub resets: Vec<(usize, Observation)>,
    /// `Checkpoint`
    pub snapshot: Option<PolicySnapshot>,
}

/// Totals across the loop's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoopSummary {
    pub ticks: u64,
    pub steps: u64,
    pub episodes: u64,
    pub rated_games: u64,
    pub void_episodes: u64,
    pub snapshots: u64,
}

pub struct SelfPlayLoop<L: Learner> {
    env: EnvironmentPool,
    opponents: SharedOpponentPool,
    checkpoints: CheckpointManager,
    learner: L,
    config: SelfPlayConfig,
    stages: Vec<Stage>,
    observations: Vec<Observation>,
    rng: ChaCha8Rng,
    /// Closed episodes not yet handed to the Elo tracker
    unrated: VecDeque<EpisodeReport>,
    /// Environment steps taken by earlier runs
    start_step: u64,
    summary: LoopSummary,
}

impl<L: Learner> SelfPlayLoop<L> {
    pub fn new(
        env: EnvironmentPool,
        opponents: SharedOpponentPool,
        checkpoints: CheckpointManager,
        learner: L,
        config: SelfPlayConfig,
    ) -> Self {
        let n = env.num_envs();
        Self {
            env,
            opponents,
            checkpoints,
            learner,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            stages: Stage::DEFAULT_ORDER.to_vec(),
            observations: vec![Observation::default(); n],
            unrated: VecDeque::new(),
            start_step: 0,
            summary: LoopSummary::default(),
        }
    }

    /// Replace the per-tick stage order
    pub fn with_stages(mut self, stages: Vec<Stage>) -> Self {
        self.stages = stages;
        self
    }

    /// Continue step numbering from a resumed snapshot
    pub fn with_start_step(mut self, step: u64) -> Self {
        self.start_step = step;
        self
    }

    /// Steps across every run, as stored in snapshots
    pub fn global_step(&self) -> u64 {
        self.start_step + self.summary.steps
    }

    pub fn environment(&self) -> &EnvironmentPool {
        &self.env
    }

    pub fn opponents(&self) -> &SharedOpponentPool {
        &self.opponents
    }

    pub fn learner(&self) -> &L {
        &self.learner
    }

    pub fn summary(&self) -> &LoopSummary {
        &self.summary
    }

    /// Reset every slot against freshly chosen opponents
    pub async fn start(&mut self) -> Result<(), SelfPlayError> {
        if self.opponents.lock().await.is_empty()
            && self.config.opponents.scripted_opponents.is_empty()
        {
            // Nothing to play against yet: the current policy becomes the first opponent.
            let step = self.global_step();
            match self.checkpoints.snapshot(step, self.learner.parameters()).await {
                Ok(snapshot) => {
                    info!(version = %snapshot.version, "Seeded opponent pool with initial policy");
                    self.summary.snapshots += 1;
                }
                Err(e) => warn!("Failed to seed opponent pool: {}", e),
            }
        }

        let mut configs = Vec::with_capacity(self.env.num_envs());
        for _ in 0..self.env.num_envs() {
            let opponent = self.choose_opponent().await?;
            configs.push(self.reset_config(opponent));
        }
        let observations = self.env.reset_all(configs).await?;
        info!(
            connected = observations.len(),
            slots = self.env.num_envs(),
            task = ?self.config.task,
            "Self-play started"
        );
        for (slot, obs) in observations {
            self.observations[slot] = obs;
        }
        Ok(())
    }

    /// Run every stage once
    pub async fn tick(&mut self) -> Result<TickContext, SelfPlayError> {
        let mut ctx = TickContext {
            tick: self.summary.ticks,
            steps_before: self.summary.steps,
            ..Default::default()
        };
        for stage in self.stages.clone() {
            self.run_stage(stage, &mut ctx).await?;
        }
        self.summary.ticks += 1;
        if self.summary.ticks % 100 == 0 {
            info!(
                ticks = self.summary.ticks,
                steps = self.summary.steps,
                episodes = self.summary.episodes,
                rated = self.summary.rated_games,
                "Self-play progress"
            );
        }
        Ok(ctx)
    }

    async fn run_stage(&mut self, stage: Stage, ctx: &mut TickContext) -> Result<(), SelfPlayError> {
        match stage {
            Stage::Act => {
                ctx.actions = self.learner.act(&self.observations);
            }
            Stage::Step => {
                let transitions = self.env.step_all(&ctx.actions).await?;
                for t in transitions.iter().filter(|t| !t.dropped) {
                    self.observations[t.slot] = t.observation.clone();
                    self.summary.steps += 1;
                }
                self.learner.learn(&transitions);
                ctx.transitions = transitions;
            }
            Stage::Rate => {
                self.unrated.extend(self.env.take_reports());
                let (updates, void) = self.rate_pending().await;
                ctx.rating_updates = updates;
                ctx.void_episodes = void;
            }
            Stage::Reset => {
                let mut slots = self.env.failed_slots();
                slots.extend(self.env.terminal_slots());
                if slots.is_empty() {
                    return Ok(());
                }
                let mut configs = BTreeMap::new();
                for slot in slots {
                    let opponent = self.choose_opponent().await?;
                    configs.insert(slot, self.reset_config(opponent));
                }
                let resets = self.env.reset_slots(configs).await;
                for (slot, obs) in &resets {
                    self.observations[*slot] = obs.clone();
                }
                ctx.resets = resets;
            }
            Stage::Checkpoint => {
                let step = self.global_step();
                if !self.checkpoints.is_due(step) {
                    return Ok(());
                }
                match self
                    .checkpoints
                    .maybe_snapshot(step, &self.learner.parameters())
                    .await
                {
                    Ok(snapshot) => {
                        if snapshot.is_some() {
                            self.summary.snapshots += 1;
                        }
                        ctx.snapshot = snapshot;
                    }
                    Err(e) => warn!("Checkpoint failed, training continues: {}", e),
                }
            }
        }
        Ok(())
    }

    /// Hand queued episode reports to the Elo tracker, each exactly once.
    /// A report leaves the queue only after it was handled, so a cancelled tick
    /// leaves the rest for the next call.
    /// Returns the rating updates and the number of void episodes.
    async fn rate_pending(&mut self) -> (Vec<RatingUpdate>, usize) {
        let mut updates = Vec::new();
        let mut void = 0;
        while let Some(report) = self.unrated.front().cloned() {
            if !report.is_void() && self.config.task.is_competitive() {
                match report.opponent.snapshot_version() {
                    Some(version) => {
                        match self.opponents.report_outcome(version, report.outcome).await {
                            Ok(Some(update)) => {
                                self.summary.rated_games += 1;
                                updates.push(update);
                            }
                            Ok(None) => {}
                            Err(OpponentPoolError::UnknownEntry(v)) => {
                                debug!(version = %v, "Opponent evicted before its result arrived");
                            }
                            Err(e) => warn!("Rating update failed: {}", e),
                        }
                    }
                    None => {
                        debug!(opponent = %report.opponent, outcome = ?report.outcome, "Scripted opponent, unrated");
                    }
                }
            }
            self.unrated.pop_front();
            self.summary.episodes += 1;
            if report.is_void() {
                void += 1;
                self.summary.void_episodes += 1;
            }
        }
        (updates, void)
    }

    /// Scripted with probability `scripted_fraction`, otherwise a pool sample.
    /// Falls back to scripted opponents while the pool is empty.
    async fn choose_opponent(&mut self) -> Result<OpponentRef, SelfPlayError> {
        let opponents = &self.config.opponents;
        let scripted = !opponents.scripted_opponents.is_empty()
            && self
                .rng
                .gen_bool(opponents.scripted_fraction.clamp(0.0, 1.0));

        if !scripted {
            match self.opponents.sample(opponents.strategy).await {
                Ok(entry) => return Ok(OpponentRef::Snapshot(entry.version)),
                Err(OpponentPoolError::Empty) => {}
                Err(e) => warn!("Opponent sampling failed: {}", e),
            }
        }

        opponents
            .scripted_opponents
            .choose(&mut self.rng)
            .map(|name| OpponentRef::Scripted(name.clone()))
            .ok_or(SelfPlayError::NoOpponent)
    }

    fn reset_config(&mut self, opponent: OpponentRef) -> ResetConfig {
        ResetConfig::new(self.config.task, opponent).with_seed(self.rng.next_u64())
    }

    /// Tick until `shutdown` flips to true or `max_ticks` ticks have run, then
    /// close every session and persist the opponent pool
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        max_ticks: Option<u64>,
    ) -> Result<LoopSummary, SelfPlayError> {
        self.start().await?;

        let result = loop {
            if *shutdown.borrow() || max_ticks.is_some_and(|max| self.summary.ticks >= max) {
                break Ok(());
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested");
                        break Ok(());
                    }
                }
                tick = self.tick() => {
                    if let Err(e) = tick {
                        break Err(e);
                    }
                }
            }
        };

        self.finish().await;
        result.map(|()| self.summary.clone())
    }

    /// Close every session, rate episodes that ended in an interrupted tick,
    /// and persist the opponent pool
    pub async fn finish(&mut self) {
        self.env.shutdown().await;
        self.unrated.extend(self.env.take_reports());
        let (updates, _) = self.rate_pending().await;
        if !updates.is_empty() {
            info!(rated = updates.len(), "Rated episodes that closed during shutdown");
        }
        let path = self.checkpoints.pool_path();
        if let Err(e) = self.opponents.lock().await.save(&path) {
            warn!("Failed to persist opponent pool: {}", e);
        }
        info!(
            ticks = self.summary.ticks,
            steps = self.summary.steps,
            episodes = self.summary.episodes,
            snapshots = self.summary.snapshots,
            "Self-play stopped"
        );
    }
}
