use crate::{RelayError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Normalized result of one task, as published to a result slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    #[serde(rename = "ret")]
    pub result: Value,

    #[serde(rename = "err")]
    pub is_error: bool,
}

impl Outcome {
    pub fn success(result: impl Into<Value>) -> Self {
        Outcome {
            result: result.into(),
            is_error: false,
        }
    }

    pub fn failure(description: impl Into<String>) -> Self {
        Outcome {
            result: Value::String(description.into()),
            is_error: true,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(RelayError::from)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(RelayError::from)
    }
}

impl From<(Value, bool)> for Outcome {
    fn from((result, is_error): (Value, bool)) -> Self {
        Outcome { result, is_error }
    }
}
