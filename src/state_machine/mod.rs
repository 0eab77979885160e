mod item;
mod session;
mod state;

pub use item::{FailureKind, HistoryEntry, ItemStatus, RetryPolicy, Status, WorkItem};
pub use session::{RunSession, SessionOutcome, SessionSummary, StatusCounts};
pub use state::{Event, StateMachine, Transition};
