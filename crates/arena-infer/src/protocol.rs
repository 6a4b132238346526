//! Inference request/response records
//!
//! Same newline framing as the training bridge, one request per line and one
//! response per request, in order.

use arena_core::{Action, ActionMasks};
use serde::{Deserialize, Serialize};

use crate::error::InferError;

fn default_deterministic() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferRequest {
    /// Snapshot file stem under the models directory, or `latest`
    pub model: String,
    pub observation: Vec<f32>,
    #[serde(default)]
    pub action_masks: ActionMasks,
    #[serde(default = "default_deterministic")]
    pub deterministic: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default)]
    pub return_value: bool,
}

impl InferRequest {
    pub fn new(model: impl Into<String>, observation: Vec<f32>) -> Self {
        Self {
            model: model.into(),
            observation,
            action_masks: ActionMasks::default(),
            deterministic: true,
            seed: None,
            return_value: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InferResponse {
    Error {
        error: ErrorBody,
    },
    Action {
        action: Action,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<f32>,
    },
}

impl InferResponse {
    pub fn error(err: &InferError) -> Self {
        InferResponse::Error {
            error: ErrorBody {
                kind: err.kind().to_string(),
                message: err.to_string(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, InferResponse::Error { .. })
    }
}

pub fn parse_request(line: &[u8]) -> Result<InferRequest, InferError> {
    serde_json::from_slice(line).map_err(|e| InferError::BadRequest(e.to_string()))
}

pub fn encode_response(response: &InferResponse) -> Vec<u8> {
    // Both variants hold only plain data
    serde_json::to_vec(response).unwrap_or_else(|_| {
        br#"{"error":{"kind":"internal","message":"response encoding failed"}}"#.to_vec()
    })
}
