//! Policy evaluation
//!
//! The trainer's network is an external collaborator; what crosses the process
//! boundary is a `PolicySnapshot` whose parameters describe one linear layer per
//! action head. `LinearPolicy` evaluates those parameters for evaluation bots and
//! self-play opponents.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::{Action, ActionMasks};
use crate::snapshot::PolicyParameters;

/// Policy evaluation errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("Observation has {got} features, policy expects {expected}")]
    InputShape { expected: usize, got: usize },

    #[error("Action mask shape mismatch: {0}")]
    MaskShape(String),

    #[error("No legal action for head {head}")]
    NoLegalAction { head: usize },

    #[error("Invalid policy parameters: {0}")]
    InvalidParameters(String),
}

/// How to pick an action from the per-head distributions
pub enum Sampling<'a> {
    /// Masked argmax per head
    Deterministic,
    /// Sample from the masked softmax using the given generator
    Stochastic(&'a mut ChaCha8Rng),
}

/// Result of `Policy::act`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyOutput {
    pub action: Action,
    /// Value estimate, if the policy has a value head
    pub value: Option<f32>,
    /// Sum of the chosen choices' log-probabilities over all heads
    pub log_prob: f32,
}

/// Anything that maps an observation and legality masks to an action
pub trait Policy: Send + Sync {
    fn act(
        &self,
        observation: &[f32],
        masks: &ActionMasks,
        sampling: Sampling<'_>,
    ) -> Result<PolicyOutput, PolicyError>;
}

/// Dense layer: `logits = weights * x + bias`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearHead {
    /// `outputs x input_dim`
    pub weights: Vec<Vec<f32>>,
    pub bias: Vec<f32>,
}

impl LinearHead {
    pub fn outputs(&self) -> usize {
        self.weights.len()
    }

    fn logits(&self, x: &[f32]) -> Vec<f32> {
        self.weights
            .iter()
            .zip(&self.bias)
            .map(|(row, b)| row.iter().zip(x).map(|(w, v)| w * v).sum::<f32>() + b)
            .collect()
    }

    fn validate(&self, input_dim: usize, name: &str) -> Result<(), PolicyError> {
        if self.weights.is_empty() {
            return Err(PolicyError::InvalidParameters(format!("{name} has no outputs")));
        }
        if self.bias.len() != self.weights.len() {
            return Err(PolicyError::InvalidParameters(format!(
                "{name} has {} rows but {} biases",
                self.weights.len(),
                self.bias.len()
            )));
        }
        if let Some(row) = self.weights.iter().find(|row| row.len() != input_dim) {
            return Err(PolicyError::InvalidParameters(format!(
                "{name} row has {} weights, expected {input_dim}",
                row.len()
            )));
        }
        Ok(())
    }
}

/// Multi-head linear policy over a snapshot's parameters
#[derive(Debug, Clone)]
pub struct LinearPolicy {
    params: PolicyParameters,
}

impl LinearPolicy {
    pub fn new(params: PolicyParameters) -> Result<Self, PolicyError> {
        if params.heads.is_empty() {
            return Err(PolicyError::InvalidParameters("no action heads".into()));
        }
        for (h, head) in params.heads.iter().enumerate() {
            head.validate(params.input_dim, &format!("head {h}"))?;
        }
        if let Some(value) = &params.value {
            value.validate(params.input_dim, "value head")?;
        }
        Ok(Self { params })
    }

    pub fn parameters(&self) -> &PolicyParameters {
        &self.params
    }

    pub fn num_heads(&self) -> usize {
        self.params.heads.len()
    }
}

impl Policy for LinearPolicy {
    fn act(
        &self,
        observation: &[f32],
        masks: &ActionMasks,
        mut sampling: Sampling<'_>,
    ) -> Result<PolicyOutput, PolicyError> {
        if observation.len() != self.params.input_dim {
            return Err(PolicyError::InputShape {
                expected: self.params.input_dim,
                got: observation.len(),
            });
        }
        if !masks.is_empty() && masks.heads.len() != self.params.heads.len() {
            return Err(PolicyError::MaskShape(format!(
                "{} masks for {} heads",
                masks.heads.len(),
                self.params.heads.len()
            )));
        }

        let mut choices = Vec::with_capacity(self.params.heads.len());
        let mut log_prob = 0.0f32;

        for (h, head) in self.params.heads.iter().enumerate() {
            let logits = head.logits(observation);
            let mask = masks.head(h);
            if let Some(mask) = mask {
                if mask.len() != logits.len() {
                    return Err(PolicyError::MaskShape(format!(
                        "head {h} mask has {} entries, head has {} choices",
                        mask.len(),
                        logits.len()
                    )));
                }
            }
            let legal: Vec<usize> = (0..logits.len())
                .filter(|&i| mask.is_none_or(|m| m[i]))
                .collect();
            if legal.is_empty() {
                return Err(PolicyError::NoLegalAction { head: h });
            }

            let max = legal
                .iter()
                .map(|&i| logits[i])
                .fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = legal.iter().map(|&i| (logits[i] - max).exp()).sum();
            let log_norm = max + sum.ln();

            let choice = match &mut sampling {
                Sampling::Deterministic => argmax(&legal, &logits),
                Sampling::Stochastic(rng) => {
                    let u: f32 = rng.r#gen();
                    let mut acc = 0.0f32;
                    let mut picked = legal[legal.len() - 1];
                    for &i in &legal {
                        acc += (logits[i] - log_norm).exp();
                        if u < acc {
                            picked = i;
                            break;
                        }
                    }
                    picked
                }
            };

            log_prob += logits[choice] - log_norm;
            choices.push(choice as u32);
        }

        let value = self
            .params
            .value
            .as_ref()
            .and_then(|v| v.logits(observation).first().copied());

        Ok(PolicyOutput {
            action: Action::new(choices),
            value,
            log_prob,
        })
    }
}

/// First legal index with the highest logit
fn argmax(legal: &[usize], logits: &[f32]) -> usize {
    let mut best = legal[0];
    for &i in &legal[1..] {
        if logits[i] > logits[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn policy() -> LinearPolicy {
        LinearPolicy::new(PolicyParameters {
            input_dim: 2,
            heads: vec![
                LinearHead {
                    weights: vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![2.0, 2.0]],
                    bias: vec![0.0, 0.0, 0.0],
                },
                LinearHead {
                    weights: vec![vec![0.0, 0.0], vec![0.0, 0.0]],
                    bias: vec![0.0, 0.0],
                },
            ],
            value: Some(LinearHead {
                weights: vec![vec![0.5, 0.5]],
                bias: vec![1.0],
            }),
        })
        .unwrap()
    }

    #[test]
    fn test_deterministic_argmax() {
        let out = policy()
            .act(&[1.0, 1.0], &ActionMasks::default(), Sampling::Deterministic)
            .unwrap();
        // head 0: logits [1, 1, 4] -> 2; head 1: tie -> first
        assert_eq!(out.action.heads, vec![2, 0]);
        assert_eq!(out.value, Some(2.0));
        assert!(out.log_prob < 0.0);
    }

    #[test]
    fn test_mask_excludes_best_choice() {
        let masks = ActionMasks::new(vec![vec![true, true, false], vec![false, true]]);
        let out = policy()
            .act(&[0.0, 3.0], &masks, Sampling::Deterministic)
            .unwrap();
        assert_eq!(out.action.heads, vec![1, 1]);
        assert!(masks.permits(&out.action));
    }

    #[test]
    fn test_stochastic_is_reproducible_for_seed() {
        let policy = policy();
        let masks = ActionMasks::default();
        let run = |seed: u64| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            (0..32)
                .map(|_| {
                    policy
                        .act(&[0.3, 0.2], &masks, Sampling::Stochastic(&mut rng))
                        .unwrap()
                        .action
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(run(7), run(7));
    }

    #[test]
    fn test_stochastic_respects_masks() {
        let policy = policy();
        let masks = ActionMasks::new(vec![vec![false, true, false], vec![true, false]]);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..100 {
            let out = policy
                .act(&[1.0, 1.0], &masks, Sampling::Stochastic(&mut rng))
                .unwrap();
            assert_eq!(out.action.heads, vec![1, 0]);
            assert!(out.log_prob.abs() < 1e-6, "single legal choice has prob 1");
        }
    }

    #[test]
    fn test_no_legal_action() {
        let masks = ActionMasks::new(vec![vec![false, false, false], vec![true, true]]);
        let err = policy()
            .act(&[1.0, 1.0], &masks, Sampling::Deterministic)
            .unwrap_err();
        assert_eq!(err, PolicyError::NoLegalAction { head: 0 });
    }

    #[test]
    fn test_shape_errors() {
        let err = policy()
            .act(&[1.0], &ActionMasks::default(), Sampling::Deterministic)
            .unwrap_err();
        assert!(matches!(err, PolicyError::InputShape { expected: 2, got: 1 }));

        let masks = ActionMasks::new(vec![vec![true, true]]);
        let err = policy()
            .act(&[1.0, 1.0], &masks, Sampling::Deterministic)
            .unwrap_err();
        assert!(matches!(err, PolicyError::MaskShape(_)));
    }

    #[test]
    fn test_rejects_ragged_parameters() {
        let err = LinearPolicy::new(PolicyParameters {
            input_dim: 3,
            heads: vec![LinearHead {
                weights: vec![vec![1.0, 2.0]],
                bias: vec![0.0],
            }],
            value: None,
        })
        .unwrap_err();
        assert!(matches!(err, PolicyError::InvalidParameters(_)));
    }
}
