//! # arena-orchestrator
//!
//! Starts the simulation and trainer processes of a job and keeps them running.
//!
//! This crate provides:
//! - `JobSpec`/`ChildSpec`: what to launch, with the simulation environment injected
//! - `Orchestrator`: start, wait and cleanup, with restart supervision
//! - `LogSink`: child output re-emitted through `tracing` and kept per child
//! - `OrchestratorRegistry`: pids and ports persisted per job for crash recovery

pub mod error;
pub mod job;
pub mod logs;
pub mod orchestrator;
pub mod process;
pub mod registry;
pub mod supervision;

pub use error::{ChildCrash, OrchestratorError};
pub use job::{ChildSpec, JobSpec};
pub use logs::{LOG_CAPACITY, LogForwardError, LogSink};
pub use orchestrator::{ChildReport, JobHandle, JobReport, Orchestrator};
pub use registry::{ChildRecord, JobRecord, OrchestratorRegistry};
pub use supervision::{RestartPolicy, SupervisionPolicy};
