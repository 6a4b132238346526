//! # arena-env
//!
//! Batched access to many concurrent matches.
//!
//! This crate provides:
//! - `MatchSession` and `SessionConnector`, the seam transports implement
//! - `EnvironmentPool`, which steps N sessions concurrently and isolates failures

pub mod pool;
pub mod session;

pub use pool::{EnvironmentPool, PoolError, PoolStats, SlotStats, SlotStatus};
pub use session::{MatchSession, SessionConnector, SessionState};
