//! Resume tickets.
//!
//! A paused invocation serializes to a stack of checkpoint frames,
//! outermost flow first. Frames are plain data; resuming is "look the flow
//! up again, restore the context, jump to the stored step id".

use serde::{Deserialize, Serialize};

use crate::context::ContextSnapshot;
use crate::error::{EngineResult, LoadError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointFrame {
    pub flow_id: String,
    pub flow_version: u32,
    pub step_id: String,
    pub context: ContextSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeTicket {
    pub frames: Vec<CheckpointFrame>,
}

impl ResumeTicket {
    pub fn to_bytes(&self) -> EngineResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| {
            LoadError::Schema {
                message: format!("failed to serialize resume ticket: {}", e),
            }
            .into()
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> EngineResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            LoadError::Schema {
                message: format!("failed to parse resume ticket: {}", e),
            }
            .into()
        })
    }
}
