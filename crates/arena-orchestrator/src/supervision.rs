//! Restart decisions for supervised children

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff never grows past this
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RestartPolicy {
    Never,
    /// Restart after a failed exit, doubling `backoff_ms` each time
    OnFailure { max_restarts: u32, backoff_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionPolicy {
    pub restart: RestartPolicy,
    /// Stop the siblings once a child is unrecoverable
    pub fail_fast: bool,
}

impl Default for SupervisionPolicy {
    fn default() -> Self {
        Self {
            restart: RestartPolicy::OnFailure {
                max_restarts: 3,
                backoff_ms: 1_000,
            },
            fail_fast: true,
        }
    }
}

/// What to do after a child exited on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Clean exit, the child is done
    Exit,
    Restart(Duration),
    /// Failed and out of restarts
    GiveUp,
}

impl SupervisionPolicy {
    /// `restarts` is how many times this child has already been restarted
    pub fn decide(&self, success: bool, restarts: u32) -> Decision {
        if success {
            return Decision::Exit;
        }
        match self.restart {
            RestartPolicy::Never => Decision::GiveUp,
            RestartPolicy::OnFailure {
                max_restarts,
                backoff_ms,
            } => {
                if restarts >= max_restarts {
                    return Decision::GiveUp;
                }
                let factor = 1u64 << restarts.min(16);
                let delay = Duration::from_millis(backoff_ms.saturating_mul(factor));
                Decision::Restart(delay.min(MAX_BACKOFF))
            }
        }
    }
}
