//! Match session traits
//!
//! A `MatchSession` is one live connection to one match inside the simulation.
//! Implement `SessionConnector` to plug a transport into the `EnvironmentPool`.

use arena_core::{Action, ConnectionError, Observation, ResetConfig, SessionError, Transition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Dialling or waiting for the first reset
    Connecting,
    /// Connected, no episode running
    Ready,
    /// Episode running, accepting actions
    Stepping,
    /// Episode ended; needs a reset before the next step
    Terminal,
    /// Unrecoverable error; every call returns `SessionError::Disconnected`
    Failed,
    Closed,
}

impl SessionState {
    /// Whether `step` can be called
    pub fn accepts_actions(self) -> bool {
        matches!(self, SessionState::Stepping)
    }

    /// Whether the connection is still usable for a reset
    pub fn is_usable(self) -> bool {
        matches!(
            self,
            SessionState::Ready | SessionState::Stepping | SessionState::Terminal
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Stepping => "stepping",
            SessionState::Terminal => "terminal",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One live match. Exactly one request is in flight at a time.
#[async_trait]
pub trait MatchSession: Send + 'static {
    /// Identifier used in logs
    fn id(&self) -> &str;

    fn state(&self) -> SessionState;

    /// Start a new episode
    async fn reset(&mut self, config: &ResetConfig) -> Result<Observation, SessionError>;

    /// Send one action and wait for the resulting transition
    async fn step(&mut self, action: &Action) -> Result<Transition, SessionError>;

    /// Best-effort close. Idempotent.
    async fn close(&mut self);
}

/// Opens sessions for pool slots
#[async_trait]
pub trait SessionConnector: Send + Sync + 'static {
    /// Open a fresh session for `slot`. Transitions it produces carry that slot.
    async fn connect(&self, slot: usize) -> Result<Box<dyn MatchSession>, ConnectionError>;
}
