//! Actions and per-head legality masks

use serde::{Deserialize, Serialize};

/// One discrete choice per action head (gear, prayer, movement, ...)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action {
    pub heads: Vec<u32>,
}

impl Action {
    pub fn new(heads: Vec<u32>) -> Self {
        Self { heads }
    }

    /// Index 0 on every head. Sent for slots the trainer has nothing for.
    pub fn noop(num_heads: usize) -> Self {
        Self {
            heads: vec![0; num_heads],
        }
    }

    pub fn num_heads(&self) -> usize {
        self.heads.len()
    }
}

impl From<Vec<u32>> for Action {
    fn from(heads: Vec<u32>) -> Self {
        Self { heads }
    }
}

/// Wire value for a single mask entry. Peers send either booleans or 0/1 numbers.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum MaskValue {
    Bool(bool),
    Number(f64),
}

impl MaskValue {
    fn is_legal(self) -> bool {
        match self {
            MaskValue::Bool(b) => b,
            MaskValue::Number(n) => n > 0.5,
        }
    }
}

/// Per-head legality vectors. `heads[h][i]` is true when choice `i` of head `h` is legal.
///
/// Serialized as nested arrays of 0/1 numbers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Vec<Vec<MaskValue>>", into = "Vec<Vec<u8>>")]
pub struct ActionMasks {
    pub heads: Vec<Vec<bool>>,
}

impl ActionMasks {
    pub fn new(heads: Vec<Vec<bool>>) -> Self {
        Self { heads }
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    pub fn head(&self, index: usize) -> Option<&[bool]> {
        self.heads.get(index).map(Vec::as_slice)
    }

    /// Whether `action` only picks legal choices. Heads without a mask are unconstrained.
    pub fn permits(&self, action: &Action) -> bool {
        action.heads.iter().enumerate().all(|(h, &choice)| {
            match self.heads.get(h) {
                Some(mask) => mask.get(choice as usize).copied().unwrap_or(false),
                None => true,
            }
        })
    }
}

impl From<Vec<Vec<MaskValue>>> for ActionMasks {
    fn from(raw: Vec<Vec<MaskValue>>) -> Self {
        Self {
            heads: raw
                .into_iter()
                .map(|head| head.into_iter().map(MaskValue::is_legal).collect())
                .collect(),
        }
    }
}

impl From<ActionMasks> for Vec<Vec<u8>> {
    fn from(masks: ActionMasks) -> Self {
        masks
            .heads
            .into_iter()
            .map(|head| head.into_iter().map(u8::from).collect())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_is_flat_array() {
        let action = Action::new(vec![2, 0, 5]);
        let json = serde_json::to_string(&action).unwrap();
        assert_eq!(json, "[2,0,5]");
    }

    #[test]
    fn test_masks_accept_numbers_and_bools() {
        let json = r#"[[1, 0, 1], [true, false]]"#;
        let masks: ActionMasks = serde_json::from_str(json).unwrap();
        assert_eq!(masks.heads, vec![vec![true, false, true], vec![true, false]]);

        let serialized = serde_json::to_string(&masks).unwrap();
        assert_eq!(serialized, "[[1,0,1],[1,0]]");
    }

    #[test]
    fn test_permits() {
        let masks = ActionMasks::new(vec![vec![true, false], vec![false, true, true]]);
        assert!(masks.permits(&Action::new(vec![0, 2])));
        assert!(!masks.permits(&Action::new(vec![1, 2])));
        assert!(!masks.permits(&Action::new(vec![0, 7])));
        // extra head beyond the masks is unconstrained
        assert!(masks.permits(&Action::new(vec![0, 1, 9])));
    }
}
