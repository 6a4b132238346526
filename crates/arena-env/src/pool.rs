//! Environment pool
//!
//! Owns exactly N slots, one session each, and presents them to the trainer as a
//! single batched environment. A failing match only ever affects its own slot:
//! its transition is replaced by a dropped no-op and the slot is scheduled for
//! reconnection.

use arena_core::config::PoolConfig;
use arena_core::{
    Action, EndReason, Episode, EpisodeId, EpisodeReport, Observation, Outcome, ResetConfig,
    Transition,
};
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::session::{MatchSession, SessionConnector, SessionState};

/// Batch shape errors. Session failures never surface here.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("Expected {expected} actions, got {got}")]
    ActionCount { expected: usize, got: usize },

    #[error("Expected {expected} reset configs, got {got}")]
    ConfigCount { expected: usize, got: usize },
}

/// Per-slot counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlotStats {
    pub steps: u64,
    pub episodes: u64,
    pub failures: u64,
    pub connects: u64,
    pub reconnects: u64,
}

/// Snapshot of one slot for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub slot: usize,
    /// `None` when no session is attached
    pub state: Option<SessionState>,
    pub scheduled_reset: bool,
    pub episode: Option<EpisodeId>,
    pub stats: SlotStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub slots: Vec<SlotStatus>,
}

impl PoolStats {
    /// Slots currently accepting actions
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == Some(SessionState::Stepping) && !s.scheduled_reset)
            .count()
    }

    pub fn total_steps(&self) -> u64 {
        self.slots.iter().map(|s| s.stats.steps).sum()
    }
}

struct Slot {
    index: usize,
    session: Option<Box<dyn MatchSession>>,
    episode: Option<Episode>,
    last_config: Option<ResetConfig>,
    /// Failures since the last successful reset
    failures: u32,
    scheduled: bool,
    /// Dialling a new session, or waiting for its first successful reset
    connecting: bool,
    stats: SlotStats,
    reports: Vec<EpisodeReport>,
}

impl Slot {
    fn new(index: usize) -> Self {
        Self {
            index,
            session: None,
            episode: None,
            last_config: None,
            failures: 0,
            scheduled: false,
            connecting: false,
            stats: SlotStats::default(),
            reports: Vec::new(),
        }
    }

    fn state(&self) -> Option<SessionState> {
        if self.connecting {
            return Some(SessionState::Connecting);
        }
        self.session_state()
    }

    fn session_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|s| s.state())
    }

    fn needs_reconnect(&self) -> bool {
        self.scheduled || !self.session_state().is_some_and(SessionState::is_usable)
    }

    fn finish_episode(&mut self, outcome: Outcome) {
        let Some(episode) = self.episode.as_mut() else {
            return;
        };
        if episode.close(outcome) {
            self.stats.episodes += 1;
            debug!(slot = self.index, episode = %episode.id, ?outcome, "Episode closed");
        }
        if let Some(report) = episode.take_report() {
            self.reports.push(report);
        }
    }

    fn record_failure(&mut self, max_failures: u32, fatal: bool) {
        self.failures += 1;
        self.stats.failures += 1;
        if fatal || self.failures >= max_failures {
            self.scheduled = true;
            self.finish_episode(Outcome::Aborted);
        }
    }

    async fn step(&mut self, action: &Action, max_failures: u32) -> Transition {
        let index = self.index;
        let Some(session) = self.session.as_mut() else {
            return Transition::dropped(index);
        };
        if self.scheduled || !session.state().accepts_actions() {
            return Transition::dropped(index);
        }

        match session.step(action).await {
            Ok(mut transition) => {
                transition.slot = index;
                self.stats.steps += 1;
                if transition.done {
                    // A terminal without a reason cannot be rated.
                    let outcome = transition
                        .end_reason
                        .map(EndReason::outcome)
                        .unwrap_or(Outcome::Aborted);
                    self.finish_episode(outcome);
                }
                transition
            }
            Err(err) => {
                let fatal = session.state() == SessionState::Failed;
                warn!(slot = index, session = session.id(), error = %err, fatal, "Step failed");
                self.record_failure(max_failures, fatal);
                Transition::dropped(index)
            }
        }
    }

    async fn reset(
        &mut self,
        connector: &dyn SessionConnector,
        config: ResetConfig,
        episode_id: EpisodeId,
    ) -> Option<Observation> {
        // Resetting mid-episode forfeits it as void.
        self.finish_episode(Outcome::Aborted);

        if self.needs_reconnect() {
            self.connecting = true;
            if let Some(mut old) = self.session.take() {
                old.close().await;
            }
            match connector.connect(self.index).await {
                Ok(session) => {
                    if self.stats.connects > 0 {
                        self.stats.reconnects += 1;
                    }
                    self.stats.connects += 1;
                    debug!(slot = self.index, session = session.id(), "Session connected");
                    self.session = Some(session);
                }
                Err(err) => {
                    warn!(slot = self.index, error = %err, "Connect failed");
                    self.failures += 1;
                    self.stats.failures += 1;
                    self.scheduled = true;
                    self.last_config = Some(config);
                    return None;
                }
            }
        }

        let session = self.session.as_mut()?;
        match session.reset(&config).await {
            Ok(observation) => {
                self.failures = 0;
                self.scheduled = false;
                self.connecting = false;
                self.episode = Some(Episode::new(
                    episode_id,
                    self.index,
                    config.opponent.clone(),
                    observation.tick,
                ));
                self.last_config = Some(config);
                Some(observation)
            }
            Err(err) => {
                warn!(slot = self.index, session = session.id(), error = %err, "Reset failed");
                self.failures += 1;
                self.stats.failures += 1;
                self.scheduled = true;
                self.last_config = Some(config);
                None
            }
        }
    }

    fn status(&self) -> SlotStatus {
        SlotStatus {
            slot: self.index,
            state: self.state(),
            scheduled_reset: self.scheduled,
            episode: self
                .episode
                .as_ref()
                .filter(|e| !e.is_closed())
                .map(|e| e.id),
            stats: self.stats.clone(),
        }
    }
}

/// N concurrent matches behind one batched interface
pub struct EnvironmentPool {
    connector: Arc<dyn SessionConnector>,
    slots: Vec<Slot>,
    max_failures_before_reset: u32,
    num_action_heads: usize,
    next_episode: u64,
}

impl EnvironmentPool {
    /// Create a pool with `config.num_envs` empty slots. Nothing connects until a reset.
    pub fn new(connector: Arc<dyn SessionConnector>, config: &PoolConfig) -> Self {
        Self {
            connector,
            slots: (0..config.num_envs).map(Slot::new).collect(),
            max_failures_before_reset: config.max_failures_before_reset.max(1),
            num_action_heads: config.num_action_heads,
            next_episode: 0,
        }
    }

    pub fn num_envs(&self) -> usize {
        self.slots.len()
    }

    /// Index 0 on every configured head
    pub fn noop_action(&self) -> Action {
        Action::noop(self.num_action_heads)
    }

    pub fn slot_state(&self, slot: usize) -> Option<SessionState> {
        self.slots.get(slot).and_then(Slot::state)
    }

    /// Currently open episode of a slot
    pub fn episode(&self, slot: usize) -> Option<&Episode> {
        self.slots
            .get(slot)?
            .episode
            .as_ref()
            .filter(|e| !e.is_closed())
    }

    /// Step every live session concurrently. Always returns exactly N transitions,
    /// in slot order. An action with the wrong number of heads is replaced by a no-op.
    pub async fn step_all(&mut self, actions: &[Action]) -> Result<Vec<Transition>, PoolError> {
        if actions.len() != self.slots.len() {
            return Err(PoolError::ActionCount {
                expected: self.slots.len(),
                got: actions.len(),
            });
        }

        let noop = self.noop_action();
        let actions: Vec<&Action> = actions
            .iter()
            .enumerate()
            .map(|(slot, action)| {
                if action.num_heads() == self.num_action_heads {
                    action
                } else {
                    warn!(
                        slot,
                        expected = self.num_action_heads,
                        got = action.num_heads(),
                        "Malformed action, sending no-op"
                    );
                    &noop
                }
            })
            .collect();

        let max_failures = self.max_failures_before_reset;
        let transitions = join_all(
            self.slots
                .iter_mut()
                .zip(actions)
                .map(|(slot, action)| slot.step(action, max_failures)),
        )
        .await;

        Ok(transitions)
    }

    /// Reset every slot, connecting where needed
    pub async fn reset_all(
        &mut self,
        configs: Vec<ResetConfig>,
    ) -> Result<Vec<(usize, Observation)>, PoolError> {
        if configs.len() != self.slots.len() {
            return Err(PoolError::ConfigCount {
                expected: self.slots.len(),
                got: configs.len(),
            });
        }
        let configs = configs.into_iter().enumerate().collect();
        Ok(self.reset_slots(configs).await)
    }

    /// Reset the given slots concurrently. Returns the observations of the slots that
    /// came back; the rest stay scheduled.
    pub async fn reset_slots(
        &mut self,
        mut configs: BTreeMap<usize, ResetConfig>,
    ) -> Vec<(usize, Observation)> {
        let connector = &*self.connector;
        let mut jobs = Vec::with_capacity(configs.len());
        for slot in self.slots.iter_mut() {
            if let Some(config) = configs.remove(&slot.index) {
                let id = EpisodeId(self.next_episode);
                self.next_episode += 1;
                jobs.push((slot, config, id));
            }
        }
        for index in configs.keys() {
            warn!(slot = index, "Reset requested for unknown slot");
        }

        let results = join_all(jobs.into_iter().map(|(slot, config, id)| async move {
            let observation = slot.reset(connector, config, id).await;
            (slot.index, observation)
        }))
        .await;

        results
            .into_iter()
            .filter_map(|(index, observation)| observation.map(|o| (index, o)))
            .collect()
    }

    /// Slots that failed or were scheduled for reconnection
    pub fn failed_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|s| s.needs_reconnect())
            .map(|s| s.index)
            .collect()
    }

    /// Slots whose match ended naturally and wait for a reset
    pub fn terminal_slots(&self) -> Vec<usize> {
        self.slots
            .iter()
            .filter(|s| !s.scheduled && s.state() == Some(SessionState::Terminal))
            .map(|s| s.index)
            .collect()
    }

    /// Reconnect and reset every failed slot with its last reset config.
    /// Slots that were never configured are left alone.
    pub async fn reset_failed(&mut self) -> Vec<(usize, Observation)> {
        let configs: BTreeMap<usize, ResetConfig> = self
            .slots
            .iter()
            .filter(|s| s.needs_reconnect())
            .filter_map(|s| s.last_config.clone().map(|c| (s.index, c)))
            .collect();
        if configs.is_empty() {
            return Vec::new();
        }
        info!(slots = ?configs.keys().collect::<Vec<_>>(), "Resetting failed slots");
        self.reset_slots(configs).await
    }

    /// Reset every slot whose match ended, with configs chosen by the caller
    pub async fn reset_terminal(
        &mut self,
        mut config_for: impl FnMut(usize) -> ResetConfig,
    ) -> Vec<(usize, Observation)> {
        let configs = self
            .terminal_slots()
            .into_iter()
            .map(|slot| (slot, config_for(slot)))
            .collect();
        self.reset_slots(configs).await
    }

    /// Drain closed-episode reports, each handed out exactly once
    pub fn take_reports(&mut self) -> Vec<EpisodeReport> {
        self.slots
            .iter_mut()
            .flat_map(|s| s.reports.drain(..))
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            slots: self.slots.iter().map(Slot::status).collect(),
        }
    }

    /// Abort open episodes and close every session
    pub async fn shutdown(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.finish_episode(Outcome::Aborted);
            slot.connecting = false;
        }
        join_all(self.slots.iter_mut().map(|slot| async move {
            if let Some(mut session) = slot.session.take() {
                session.close().await;
            }
        }))
        .await;
        info!(slots = self.slots.len(), "Environment pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arena_core::{ConnectionError, OpponentRef, SessionError, TaskKind};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, Default)]
    struct Plan {
        /// Step number (1-based) that ends the match with a win
        win_at: Option<u64>,
        /// Step number that times out and fails the session
        timeout_at: Option<u64>,
        /// Step numbers the simulation rejects without failing the session
        reject_from: Option<u64>,
    }

    struct FakeSession {
        slot: usize,
        id: String,
        state: SessionState,
        steps: u64,
        plan: Plan,
    }

    #[async_trait]
    impl MatchSession for FakeSession {
        fn id(&self) -> &str {
            &self.id
        }

        fn state(&self) -> SessionState {
            self.state
        }

        async fn reset(&mut self, _config: &ResetConfig) -> Result<Observation, SessionError> {
            if self.state == SessionState::Failed {
                return Err(SessionError::Disconnected);
            }
            self.steps = 0;
            self.state = SessionState::Stepping;
            Ok(Observation {
                features: vec![0.0],
                ..Default::default()
            })
        }

        async fn step(&mut self, action: &Action) -> Result<Transition, SessionError> {
            if self.state == SessionState::Failed {
                return Err(SessionError::Disconnected);
            }
            self.steps += 1;
            if self.plan.timeout_at == Some(self.steps) {
                self.state = SessionState::Failed;
                return Err(SessionError::Timeout);
            }
            if self.plan.reject_from.is_some_and(|n| self.steps >= n) {
                return Err(SessionError::Protocol("rejected".into()));
            }
            let done = self.plan.win_at == Some(self.steps);
            if done {
                self.state = SessionState::Terminal;
            }
            Ok(Transition {
                slot: self.slot,
                observation: Observation {
                    features: vec![action.heads[0] as f32],
                    tick: self.steps,
                    ..Default::default()
                },
                reward: 1.0,
                done,
                dropped: false,
                end_reason: done.then_some(EndReason::Win),
                info: Default::default(),
            })
        }

        async fn close(&mut self) {
            self.state = SessionState::Closed;
        }
    }

    #[derive(Default)]
    struct FakeConnector {
        plans: Mutex<HashMap<usize, Plan>>,
        refuse: Mutex<HashSet<usize>>,
        connects: AtomicUsize,
    }

    impl FakeConnector {
        fn plan(&self, slot: usize, plan: Plan) {
            self.plans.lock().unwrap().insert(slot, plan);
        }
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn connect(&self, slot: usize) -> Result<Box<dyn MatchSession>, ConnectionError> {
            if self.refuse.lock().unwrap().contains(&slot) {
                return Err(ConnectionError::new(format!("fake:{slot}"), "refused"));
            }
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            let plan = self.plans.lock().unwrap().remove(&slot).unwrap_or_default();
            Ok(Box::new(FakeSession {
                slot,
                id: format!("fake-{slot}-{n}"),
                state: SessionState::Ready,
                steps: 0,
                plan,
            }))
        }
    }

    fn config() -> ResetConfig {
        ResetConfig::new(TaskKind::Combat, OpponentRef::Scripted("bot".into()))
    }

    fn pool(connector: Arc<FakeConnector>, n: usize, max_failures: u32) -> EnvironmentPool {
        EnvironmentPool::new(
            connector,
            &PoolConfig {
                num_envs: n,
                max_failures_before_reset: max_failures,
                num_action_heads: 1,
            },
        )
    }

    fn actions(n: usize) -> Vec<Action> {
        (0..n).map(|i| Action::new(vec![i as u32])).collect()
    }

    #[tokio::test]
    async fn test_step_all_survives_all_but_one_failure() {
        let connector = Arc::new(FakeConnector::default());
        for slot in 0..3 {
            connector.plan(
                slot,
                Plan {
                    timeout_at: Some(1),
                    ..Default::default()
                },
            );
        }
        let mut pool = pool(connector, 4, 1);
        assert_eq!(pool.reset_all(vec![config(); 4]).await.unwrap().len(), 4);

        let transitions = pool.step_all(&actions(4)).await.unwrap();
        assert_eq!(transitions.len(), 4);
        for (i, t) in transitions.iter().enumerate() {
            assert_eq!(t.slot, i);
        }
        assert!(transitions[..3].iter().all(|t| t.dropped && t.done));
        assert!(!transitions[3].dropped);
        assert_eq!(transitions[3].observation.features, vec![3.0]);
        assert_eq!(pool.failed_slots(), vec![0, 1, 2]);

        let reports = pool.take_reports();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(EpisodeReport::is_void));
    }

    #[tokio::test]
    async fn test_action_count_mismatch() {
        let mut pool = pool(Arc::new(FakeConnector::default()), 2, 1);
        let err = pool.step_all(&actions(3)).await.unwrap_err();
        assert_eq!(err, PoolError::ActionCount { expected: 2, got: 3 });
    }

    #[tokio::test]
    async fn test_malformed_action_becomes_noop() {
        let mut pool = pool(Arc::new(FakeConnector::default()), 2, 1);
        pool.reset_all(vec![config(); 2]).await.unwrap();

        let t = pool
            .step_all(&[Action::new(vec![4, 4]), Action::new(vec![1])])
            .await
            .unwrap();
        assert!(t.iter().all(|t| !t.dropped));
        assert_eq!(t[0].observation.features, vec![0.0]);
        assert_eq!(t[1].observation.features, vec![1.0]);
        assert_eq!(pool.noop_action(), Action::new(vec![0]));
    }

    #[tokio::test]
    async fn test_timeout_then_reset_failed_restores_slot() {
        let connector = Arc::new(FakeConnector::default());
        connector.plan(
            1,
            Plan {
                timeout_at: Some(2),
                ..Default::default()
            },
        );
        let mut pool = pool(connector.clone(), 2, 1);
        pool.reset_all(vec![config(); 2]).await.unwrap();

        pool.step_all(&actions(2)).await.unwrap();
        let second = pool.step_all(&actions(2)).await.unwrap();
        assert!(second[1].dropped);
        assert_eq!(pool.slot_state(1), Some(SessionState::Failed));

        // Still full-length with the failed slot dropped
        let third = pool.step_all(&actions(2)).await.unwrap();
        assert_eq!(third.len(), 2);
        assert!(!third[0].dropped);
        assert!(third[1].dropped);

        // The simulation refuses the first reconnect
        connector.refuse.lock().unwrap().insert(1);
        assert!(pool.reset_failed().await.is_empty());
        assert_eq!(pool.slot_state(1), Some(SessionState::Connecting));
        assert_eq!(pool.failed_slots(), vec![1]);
        connector.refuse.lock().unwrap().clear();

        let restored = pool.reset_failed().await;
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].0, 1);
        assert_eq!(pool.slot_state(1), Some(SessionState::Stepping));
        assert!(pool.failed_slots().is_empty());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

        let fourth = pool.step_all(&actions(2)).await.unwrap();
        assert!(fourth.iter().all(|t| !t.dropped));

        let stats = pool.stats();
        assert_eq!(stats.slots[1].stats.reconnects, 1);
        assert_eq!(stats.slots[1].stats.failures, 2);
        assert_eq!(stats.live(), 2);
    }

    #[tokio::test]
    async fn test_terminal_closes_episode_once() {
        let connector = Arc::new(FakeConnector::default());
        connector.plan(
            0,
            Plan {
                win_at: Some(1),
                ..Default::default()
            },
        );
        let mut pool = pool(connector, 1, 1);
        pool.reset_all(vec![config()]).await.unwrap();
        let first_episode = pool.episode(0).map(|e| e.id);

        let t = pool.step_all(&actions(1)).await.unwrap();
        assert!(t[0].is_terminal());
        assert_eq!(pool.slot_state(0), Some(SessionState::Terminal));

        let reports = pool.take_reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, Outcome::Win);
        assert!(pool.take_reports().is_empty());

        // No transitions past the terminal signal
        let t = pool.step_all(&actions(1)).await.unwrap();
        assert!(t[0].dropped);

        assert_eq!(pool.terminal_slots(), vec![0]);
        let restored = pool.reset_terminal(|_| config()).await;
        assert_eq!(restored.len(), 1);
        assert_ne!(pool.episode(0).map(|e| e.id), first_episode);
        // Reset on a live session does not reconnect
        assert_eq!(pool.stats().slots[0].stats.connects, 1);
    }

    #[tokio::test]
    async fn test_rejections_count_toward_threshold() {
        let connector = Arc::new(FakeConnector::default());
        connector.plan(
            0,
            Plan {
                reject_from: Some(1),
                ..Default::default()
            },
        );
        let mut pool = pool(connector, 1, 2);
        pool.reset_all(vec![config()]).await.unwrap();

        let t = pool.step_all(&actions(1)).await.unwrap();
        assert!(t[0].dropped);
        assert!(pool.failed_slots().is_empty());
        assert!(pool.episode(0).is_some());

        pool.step_all(&actions(1)).await.unwrap();
        assert_eq!(pool.failed_slots(), vec![0]);
        assert!(pool.episode(0).is_none());
        assert_eq!(pool.take_reports()[0].outcome, Outcome::Aborted);
    }

    #[tokio::test]
    async fn test_refused_connection_isolated() {
        let connector = Arc::new(FakeConnector::default());
        connector.refuse.lock().unwrap().insert(0);
        let mut pool = pool(connector.clone(), 2, 1);

        let observations = pool.reset_all(vec![config(); 2]).await.unwrap();
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].0, 1);
        assert_eq!(pool.slot_state(0), Some(SessionState::Connecting));

        let t = pool.step_all(&actions(2)).await.unwrap();
        assert!(t[0].dropped);
        assert!(!t[1].dropped);

        connector.refuse.lock().unwrap().clear();
        assert_eq!(pool.reset_failed().await.len(), 1);
        assert_eq!(pool.stats().live(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_voids_open_episodes() {
        let mut pool = pool(Arc::new(FakeConnector::default()), 3, 1);
        pool.reset_all(vec![config(); 3]).await.unwrap();
        pool.shutdown().await;

        let reports = pool.take_reports();
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(EpisodeReport::is_void));
        assert!((0..3).all(|i| pool.slot_state(i).is_none()));
    }
}
