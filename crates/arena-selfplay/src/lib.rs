//! # arena-selfplay
//!
//! Self-play on top of the environment pool.
//!
//! This crate provides:
//! - `OpponentPool`: rated past snapshots, sampling and retention
//! - `CheckpointManager`: cadence-driven, crash-safe snapshot writes
//! - `SelfPlayLoop`: the staged per-tick training loop

pub mod checkpoint;
pub mod opponent_pool;
pub mod storage;
pub mod trainer;

pub use checkpoint::{CheckpointError, CheckpointManager, list_versions, read_snapshot};
pub use opponent_pool::{
    OpponentPool, OpponentPoolEntry, OpponentPoolError, POOL_FILE, RatingUpdate,
    SharedOpponentPool,
};
pub use trainer::{
    Learner, LoopSummary, PolicyLearner, SelfPlayConfig, SelfPlayError, SelfPlayLoop, Stage,
    TickContext,
};
