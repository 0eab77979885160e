use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::item::{Status, WorkItem};

/// How a harness run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Every item reached `Done`.
    CompletedAll,
    /// Nothing left to run, but some items failed or stay blocked behind them.
    PartiallyBlocked,
    /// Nothing left to run and at least one item failed with a fatal error.
    AbortedOnFatal,
    /// Stopped by a cancellation signal or the iteration cap.
    Interrupted,
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionOutcome::CompletedAll => write!(f, "completed-all"),
            SessionOutcome::PartiallyBlocked => write!(f, "partially-blocked"),
            SessionOutcome::AbortedOnFatal => write!(f, "aborted-on-fatal"),
            SessionOutcome::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// One execution of the harness, persisted alongside the items.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSession {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcome: Option<SessionOutcome>,
}

impl RunSession {
    pub fn start(now: DateTime<Utc>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            started_at: now,
            ended_at: None,
            outcome: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Close the session. Returns `false` if it was already closed.
    pub fn close(&mut self, outcome: SessionOutcome, now: DateTime<Utc>) -> bool {
        if !self.is_open() {
            return false;
        }
        self.ended_at = Some(now);
        self.outcome = Some(outcome);
        true
    }
}

/// Per-status item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub blocked: usize,
    pub done: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn tally<'a>(items: impl IntoIterator<Item = &'a WorkItem>) -> Self {
        let mut counts = Self::default();
        for item in items {
            counts.add(item.state());
        }
        counts
    }

    pub fn add(&mut self, status: Status) {
        match status {
            Status::Pending => self.pending += 1,
            Status::InProgress => self.in_progress += 1,
            Status::Blocked => self.blocked += 1,
            Status::Done => self.done += 1,
            Status::Failed => self.failed += 1,
        }
    }

    pub fn get(&self, status: Status) -> usize {
        match status {
            Status::Pending => self.pending,
            Status::InProgress => self.in_progress,
            Status::Blocked => self.blocked,
            Status::Done => self.done,
            Status::Failed => self.failed,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.blocked + self.done + self.failed
    }
}

/// What a finished session reports to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub outcome: SessionOutcome,
    pub counts: StatusCounts,
    pub invocations: u32,
}

impl SessionSummary {
    /// Success only when the session completed and nothing failed.
    pub fn is_success(&self) -> bool {
        self.outcome == SessionOutcome::CompletedAll && self.counts.failed == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_closes_exactly_once() {
        let now = Utc::now();
        let mut session = RunSession::start(now);
        assert!(session.is_open());

        assert!(session.close(SessionOutcome::Interrupted, now));
        assert!(!session.close(SessionOutcome::CompletedAll, now));
        assert_eq!(session.outcome, Some(SessionOutcome::Interrupted));
        assert_eq!(session.ended_at, Some(now));
    }

    #[test]
    fn counts_tally_items() {
        let mut done = WorkItem::new("a", "x");
        done.status.state = Status::Done;
        let pending = WorkItem::new("b", "y");

        let counts = StatusCounts::tally([&done, &pending]);
        assert_eq!(counts.done, 1);
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.get(Status::Failed), 0);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn outcome_display() {
        assert_eq!(SessionOutcome::CompletedAll.to_string(), "completed-all");
        assert_eq!(SessionOutcome::AbortedOnFatal.to_string(), "aborted-on-fatal");
    }
}
