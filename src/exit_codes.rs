//! Process exit codes of the `ralph` binary.

use crate::state_machine::{SessionOutcome, SessionSummary};

/// Every item is done.
pub const OK: i32 = 0;
/// The session finished but some items failed or are still blocked.
pub const INCOMPLETE: i32 = 1;
/// The PRD or the configuration is missing, invalid or corrupt.
pub const INVALID: i32 = 2;
/// Stopped by Ctrl-C or the iteration cap.
pub const INTERRUPTED: i32 = 130;

pub fn for_summary(summary: &SessionSummary) -> i32 {
    match summary.outcome {
        SessionOutcome::Interrupted => INTERRUPTED,
        _ if summary.is_success() => OK,
        _ => INCOMPLETE,
    }
}
