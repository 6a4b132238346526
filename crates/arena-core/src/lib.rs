//! # arena-core
//!
//! Core types for the pvp-arena self-play bridge.
//!
//! This crate provides the foundational types shared by every other crate:
//! - Actions, action masks and observations exchanged with the simulation
//! - Transitions, episodes and match outcomes
//! - Policy snapshots and the `Policy` trait used to evaluate them
//! - The Elo rating tracker
//! - Configuration and the error taxonomy

pub mod action;
pub mod config;
pub mod elo;
pub mod episode;
pub mod error;
pub mod observation;
pub mod policy;
pub mod snapshot;
pub mod task;

pub use action::{Action, ActionMasks};
pub use config::ArenaConfig;
pub use elo::{EloConfig, EloError, EloTracker};
pub use episode::{Episode, EpisodeId, EpisodeReport, OpponentRef, Outcome};
pub use error::{ConfigError, ConnectionError, SessionError};
pub use observation::{EndReason, Observation, Transition};
pub use policy::{LinearHead, LinearPolicy, Policy, PolicyError, PolicyOutput, Sampling};
pub use snapshot::{PolicyParameters, PolicySnapshot, SnapshotVersion};
pub use task::{ResetConfig, TaskKind};
