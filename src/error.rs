use std::path::PathBuf;

use thiserror::Error;

use crate::state_machine::{Event, Status};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("PRD document not found at {0}. Create .ralph/prd.json first.")]
    NotFound(PathBuf),

    #[error("Corrupt state document {path}: {reason}")]
    CorruptState { path: PathBuf, reason: String },

    #[error("Illegal transition for item {id}: {from} does not accept {event}")]
    IllegalTransition { id: String, from: Status, event: Event },

    #[error("Item {id} cannot start: dependencies not done ({pending})")]
    DependenciesUnmet { id: String, pending: String },

    #[error("Item not found: {0}")]
    ItemNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        HarnessError::CorruptState {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
