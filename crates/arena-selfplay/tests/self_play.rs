//! Self-play loop against in-memory matches

use arena_core::config::{
    CheckpointConfig, OpponentConfig, PoolConfig, RetentionPolicy, RetryPolicy, SamplingStrategy,
};
use arena_core::{
    Action, ConnectionError, EloConfig, EndReason, LinearHead, Observation, OpponentRef,
    PolicyParameters, ResetConfig, SessionError, TaskKind, Transition,
};
use arena_env::{EnvironmentPool, MatchSession, SessionConnector, SessionState};
use arena_selfplay::{
    CheckpointManager, Learner, OpponentPool, POOL_FILE, SelfPlayConfig, SelfPlayLoop,
    SharedOpponentPool, Stage,
};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Steps per match
const MATCH_LENGTH: u64 = 3;

struct ScriptedMatch {
    slot: usize,
    id: String,
    state: SessionState,
    steps: u64,
    episodes: u64,
    opponents: Arc<Mutex<Vec<OpponentRef>>>,
}

#[async_trait]
impl MatchSession for ScriptedMatch {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn reset(&mut self, config: &ResetConfig) -> Result<Observation, SessionError> {
        self.opponents.lock().unwrap().push(config.opponent.clone());
        self.steps = 0;
        self.episodes += 1;
        self.state = SessionState::Stepping;
        Ok(Observation {
            features: vec![1.0],
            ..Default::default()
        })
    }

    async fn step(&mut self, _action: &Action) -> Result<Transition, SessionError> {
        self.steps += 1;
        let done = self.steps >= MATCH_LENGTH;
        let end_reason = if (self.episodes + self.slot as u64) % 2 == 0 {
            EndReason::Win
        } else {
            EndReason::Loss
        };
        if done {
            self.state = SessionState::Terminal;
        }
        Ok(Transition {
            slot: self.slot,
            observation: Observation {
                features: vec![1.0],
                tick: self.steps,
                ..Default::default()
            },
            reward: 0.0,
            done,
            dropped: false,
            end_reason: done.then_some(end_reason),
            info: Default::default(),
        })
    }

    async fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

#[derive(Default)]
struct ScriptedConnector {
    opponents: Arc<Mutex<Vec<OpponentRef>>>,
}

#[async_trait]
impl SessionConnector for ScriptedConnector {
    async fn connect(&self, slot: usize) -> Result<Box<dyn MatchSession>, ConnectionError> {
        Ok(Box::new(ScriptedMatch {
            slot,
            id: format!("scripted-{slot}"),
            state: SessionState::Ready,
            steps: 0,
            episodes: 0,
            opponents: self.opponents.clone(),
        }))
    }
}

#[derive(Default)]
struct CountingLearner {
    batches: usize,
    transitions: usize,
}

impl Learner for CountingLearner {
    fn act(&mut self, observations: &[Observation]) -> Vec<Action> {
        observations.iter().map(|_| Action::new(vec![0])).collect()
    }

    fn learn(&mut self, transitions: &[Transition]) {
        self.batches += 1;
        self.transitions += transitions.len();
    }

    fn parameters(&self) -> PolicyParameters {
        PolicyParameters {
            input_dim: 1,
            heads: vec![LinearHead {
                weights: vec![vec![1.0], vec![-1.0]],
                bias: vec![0.0, 0.0],
            }],
            value: None,
        }
    }
}

/// Slot 0 wins on its first step; every other slot never answers a step
struct StallingMatch {
    slot: usize,
    state: SessionState,
}

#[async_trait]
impl MatchSession for StallingMatch {
    fn id(&self) -> &str {
        "stalling"
    }

    fn state(&self) -> SessionState {
        self.state
    }

    async fn reset(&mut self, _config: &ResetConfig) -> Result<Observation, SessionError> {
        self.state = SessionState::Stepping;
        Ok(Observation {
            features: vec![1.0],
            ..Default::default()
        })
    }

    async fn step(&mut self, _action: &Action) -> Result<Transition, SessionError> {
        if self.slot != 0 {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        self.state = SessionState::Terminal;
        Ok(Transition {
            slot: self.slot,
            observation: Observation::default(),
            reward: 1.0,
            done: true,
            dropped: false,
            end_reason: Some(EndReason::Win),
            info: Default::default(),
        })
    }

    async fn close(&mut self) {
        self.state = SessionState::Closed;
    }
}

struct StallingConnector;

#[async_trait]
impl SessionConnector for StallingConnector {
    async fn connect(&self, slot: usize) -> Result<Box<dyn MatchSession>, ConnectionError> {
        Ok(Box::new(StallingMatch {
            slot,
            state: SessionState::Ready,
        }))
    }
}

fn build(
    dir: &Path,
    scripted: Vec<String>,
    cadence_steps: u64,
) -> (SelfPlayLoop<CountingLearner>, Arc<Mutex<Vec<OpponentRef>>>) {
    let connector = ScriptedConnector::default();
    let seen = connector.opponents.clone();
    let lp = build_with(dir, Arc::new(connector), scripted, cadence_steps, 0);
    (lp, seen)
}

/// `resume_step` is the step of the checkpoint a previous run stopped at
fn build_with(
    dir: &Path,
    connector: Arc<dyn SessionConnector>,
    scripted: Vec<String>,
    cadence_steps: u64,
    resume_step: u64,
) -> SelfPlayLoop<CountingLearner> {
    let env = EnvironmentPool::new(
        connector,
        &PoolConfig {
            num_envs: 2,
            ..Default::default()
        },
    );
    let retention = RetentionPolicy {
        max_entries: 3,
        keep_top_rated: 1,
        keep_recent: 1,
    };
    let opponents = SharedOpponentPool::new(OpponentPool::new(EloConfig::default(), retention, 7));
    let checkpoints = CheckpointManager::new(
        &CheckpointConfig {
            dir: dir.to_path_buf(),
            cadence_steps,
            retry: RetryPolicy::default(),
        },
        opponents.clone(),
    )
    .unwrap()
    .with_last_snapshot_step(resume_step);
    let config = SelfPlayConfig {
        task: TaskKind::Combat,
        opponents: OpponentConfig {
            strategy: SamplingStrategy::Latest,
            retention,
            scripted_fraction: 0.0,
            scripted_opponents: scripted,
        },
        seed: 3,
    };
    SelfPlayLoop::new(env, opponents, checkpoints, CountingLearner::default(), config)
        .with_start_step(resume_step)
}

#[tokio::test]
async fn test_loop_rates_snapshot_opponents() {
    let dir = tempfile::tempdir().unwrap();
    let (mut lp, seen) = build(dir.path(), vec!["nh_baseline".into()], 4);

    lp.start().await.unwrap();
    // Empty pool: first matches are against the scripted bot
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .all(|o| matches!(o, OpponentRef::Scripted(_))));

    let mut updates = 0;
    for _ in 0..30 {
        let ctx = lp.tick().await.unwrap();
        assert_eq!(ctx.actions.len(), 2);
        assert_eq!(ctx.transitions.len(), 2);
        for u in &ctx.rating_updates {
            let agent_delta = u.agent_after - u.agent_before;
            let entry_delta = u.entry_after - u.entry_before;
            assert!((agent_delta + entry_delta).abs() < 1e-9);
            updates += 1;
        }
    }
    lp.finish().await;

    let summary = lp.summary().clone();
    assert_eq!(summary.ticks, 30);
    assert_eq!(summary.steps, 60);
    assert_eq!(summary.rated_games, updates);
    assert!(summary.rated_games > 0);
    assert!(summary.snapshots >= 2);
    assert_eq!(lp.learner().batches, 30);
    assert_eq!(lp.learner().transitions, 60);

    // Once a snapshot exists, resets pick it over the scripted fallback
    assert!(seen
        .lock()
        .unwrap()
        .iter()
        .any(|o| matches!(o, OpponentRef::Snapshot(_))));

    assert!(dir.path().join(POOL_FILE).exists());
    assert!(lp.opponents().lock().await.len() <= 3);
}

#[tokio::test]
async fn test_empty_pool_is_seeded_without_scripted_bots() {
    let dir = tempfile::tempdir().unwrap();
    let (mut lp, seen) = build(dir.path(), Vec::new(), 1_000);

    lp.start().await.unwrap();
    assert_eq!(lp.summary().snapshots, 1);
    assert!(dir.path().join("snapshot_000001.json").exists());
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen
        .iter()
        .all(|o| o.snapshot_version().map(|v| v.0) == Some(1)));
}

#[tokio::test]
async fn test_without_reset_stage_finished_slots_stay_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let (lp, _) = build(dir.path(), vec!["nh_baseline".into()], 1_000);
    let mut lp = lp.with_stages(vec![Stage::Act, Stage::Step, Stage::Rate]);

    lp.start().await.unwrap();
    for _ in 0..MATCH_LENGTH {
        lp.tick().await.unwrap();
    }
    assert_eq!(lp.environment().terminal_slots(), vec![0, 1]);

    let ctx = lp.tick().await.unwrap();
    assert!(ctx.transitions.iter().all(|t| t.dropped));
    assert!(ctx.resets.is_empty());
    assert_eq!(lp.summary().episodes, 2);
}

#[tokio::test]
async fn test_run_honours_limits_and_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let (mut lp, _) = build(dir.path(), vec!["nh_baseline".into()], 1_000);
    let (_tx, rx) = watch::channel(false);
    let summary = lp.run(rx, Some(7)).await.unwrap();
    assert_eq!(summary.ticks, 7);
    // Open episodes are voided at shutdown
    assert_eq!(summary.void_episodes, 2);

    let dir = tempfile::tempdir().unwrap();
    let (mut lp, _) = build(dir.path(), vec!["nh_baseline".into()], 1_000);
    let (tx, rx) = watch::channel(false);
    tx.send(true).unwrap();
    let summary = lp.run(rx, None).await.unwrap();
    assert_eq!(summary.ticks, 0);
    assert!(dir.path().join(POOL_FILE).exists());
}

#[tokio::test]
async fn test_resumed_run_keeps_checkpoint_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let connector = Arc::new(ScriptedConnector::default());
    let mut lp = build_with(dir.path(), connector, vec!["nh_baseline".into()], 4, 10_000);

    lp.start().await.unwrap();
    for _ in 0..30 {
        lp.tick().await.unwrap();
    }
    lp.finish().await;

    assert_eq!(lp.summary().steps, 60);
    assert_eq!(lp.global_step(), 10_060);
    assert!(lp.summary().snapshots >= 2);
    let entries = lp.opponents().entries().await;
    assert!(!entries.is_empty());
    assert!(entries.iter().all(|e| e.step > 10_000));
}

#[tokio::test]
async fn test_shutdown_mid_tick_still_rates_finished_matches() {
    let dir = tempfile::tempdir().unwrap();
    let mut lp = build_with(dir.path(), Arc::new(StallingConnector), Vec::new(), 1_000, 0);

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
    });
    let summary = tokio::time::timeout(Duration::from_secs(10), lp.run(rx, None))
        .await
        .unwrap()
        .unwrap();

    // Slot 0 won inside the interrupted tick, slot 1 was voided by the shutdown
    assert_eq!(summary.episodes, 2);
    assert_eq!(summary.void_episodes, 1);
    assert_eq!(summary.rated_games, 1);

    let pool = lp.opponents().lock().await;
    assert!(pool.agent_rating() > 1500.0);
    assert_eq!(pool.entries()[0].games_played, 1);
}
