//! Best-effort durable record of completed work.

use anyhow::Result;

use crate::agent::Artifacts;
use crate::state_machine::WorkItem;

/// Receives every item that reaches `Done`.
///
/// Returns an identifier for the checkpoint (e.g. a short commit hash), or
/// `None` when there was nothing to record. Errors are logged by the caller
/// and never undo the `Done` transition.
pub trait Checkpoint {
    fn checkpoint(&self, item: &WorkItem, artifacts: &Artifacts) -> Result<Option<String>>;
}

/// Used with `--no-commit`.
pub struct NoCheckpoint;

impl Checkpoint for NoCheckpoint {
    fn checkpoint(&self, _item: &WorkItem, _artifacts: &Artifacts) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Commit message for a completed item.
pub fn commit_message(item: &WorkItem) -> String {
    format!("ralph: Complete {} - {}", item.id, item.title)
}
