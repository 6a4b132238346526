//! # arena-infer
//!
//! Serves actions from policy snapshots to evaluation bots.
//!
//! The server only needs the checkpoint directory: models are loaded lazily by
//! name, kept in a bounded LRU cache and answered over newline-delimited JSON.

pub mod cache;
pub mod error;
pub mod protocol;
pub mod server;

pub use cache::{LATEST, LoadedModel, ModelCache, load_model, resolve_model};
pub use error::InferError;
pub use protocol::{ErrorBody, InferRequest, InferResponse};
pub use server::{InferenceServer, run};
