//! Elo rating tracker
//!
//! Logistic expected-score model:
//! `expected_a = 1 / (1 + 10^((rating_b - rating_a) / 400))`,
//! `new_a = rating_a + K * (score_a - expected_a)`, symmetric for B.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::episode::Outcome;

/// Elo parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EloConfig {
    /// K-factor for decisive games
    pub k_factor: f64,
    /// K-factor for draws; falls back to `k_factor`
    pub draw_k_factor: Option<f64>,
    /// Rating given to the agent and to entries registered without a seed
    pub initial_rating: f64,
}

impl Default for EloConfig {
    fn default() -> Self {
        Self {
            k_factor: 32.0,
            draw_k_factor: None,
            initial_rating: 1500.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EloError {
    /// Aborted episodes are void, never draws
    #[error("Void outcome cannot update ratings")]
    VoidOutcome,
}

/// Expected score of A against B
pub fn expected_score(rating_a: f64, rating_b: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((rating_b - rating_a) / 400.0))
}

/// Stateless rating updater
#[derive(Debug, Clone, Copy, Default)]
pub struct EloTracker {
    config: EloConfig,
}

impl EloTracker {
    pub fn new(config: EloConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EloConfig {
        &self.config
    }

    /// New ratings for A and B after a game whose result, from A's side, is `outcome`.
    ///
    /// Both sides use the same K, so the deltas always sum to zero.
    pub fn update(
        &self,
        rating_a: f64,
        rating_b: f64,
        outcome: Outcome,
    ) -> Result<(f64, f64), EloError> {
        let score_a = outcome.score().ok_or(EloError::VoidOutcome)?;
        let k = match outcome {
            Outcome::Draw => self.config.draw_k_factor.unwrap_or(self.config.k_factor),
            _ => self.config.k_factor,
        };

        let expected_a = expected_score(rating_a, rating_b);
        let delta = k * (score_a - expected_a);
        Ok((rating_a + delta, rating_b - delta))
    }
}
