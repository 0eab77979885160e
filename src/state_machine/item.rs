use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a work item.
///
/// `todo` and `doing` are accepted on load so documents written by older
/// harness versions keep working.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    #[serde(alias = "todo")]
    Pending,
    #[serde(alias = "doing")]
    InProgress,
    Blocked,
    Done,
    Failed,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::Pending,
        Status::InProgress,
        Status::Blocked,
        Status::Done,
        Status::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Done | Status::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Pending => write!(f, "pending"),
            Status::InProgress => write!(f, "in_progress"),
            Status::Blocked => write!(f, "blocked"),
            Status::Done => write!(f, "done"),
            Status::Failed => write!(f, "failed"),
        }
    }
}

/// Distinguishes failures a retry may fix from those it cannot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, transient tool error, malformed-but-retryable response.
    Recoverable(String),
    /// The task itself cannot succeed; never retried.
    Fatal(String),
}

impl FailureKind {
    pub fn message(&self) -> &str {
        match self {
            FailureKind::Recoverable(msg) | FailureKind::Fatal(msg) => msg,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, FailureKind::Fatal(_))
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Recoverable(msg) => write!(f, "Recoverable failure: {msg}"),
            FailureKind::Fatal(msg) => write!(f, "Fatal failure: {msg}"),
        }
    }
}

/// Retry budget and exponential backoff settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts allowed before a recoverable failure becomes terminal.
    pub retry_budget: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Upper bound for a single backoff delay, in milliseconds.
    pub backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_budget: 3,
            backoff_base_ms: 1000,
            backoff_cap_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// delay = min(base * 2^(attempt - 1), cap)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let ms = 2u64
            .checked_pow(exp)
            .and_then(|factor| self.backoff_base_ms.checked_mul(factor))
            .unwrap_or(u64::MAX)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }

    pub fn budget_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.retry_budget
    }
}

/// One recorded status change. Entries are appended, never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub from: Status,
    pub to: Status,
    #[serde(default)]
    pub note: String,
}

/// Mutable tracking block of a work item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStatus {
    #[serde(default)]
    pub state: Status,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<FailureKind>,
    /// Backoff window: the item is not eligible before this instant.
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub done_at: Option<DateTime<Utc>>,
}

/// A single task in the PRD.
///
/// Everything except `id`, `depends_on`, `status` and `history` is opaque
/// to the engine and only forwarded to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub files_hint: Vec<String>,
    #[serde(default)]
    pub verify: Option<Vec<String>>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            description: description.into(),
            acceptance_criteria: Vec::new(),
            files_hint: Vec::new(),
            verify: None,
            depends_on: Vec::new(),
            status: ItemStatus::default(),
            history: Vec::new(),
        }
    }

    pub fn depending_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|id| id.to_string()).collect();
        self
    }

    pub fn state(&self) -> Status {
        self.status.state
    }

    /// Whether the backoff window (if any) has elapsed at `now`.
    pub fn ready_at(&self, now: DateTime<Utc>) -> bool {
        self.status.not_before.is_none_or(|nb| nb <= now)
    }

    /// Number of history entries that entered `InProgress`.
    pub fn started_count(&self) -> usize {
        self.history
            .iter()
            .filter(|h| h.to == Status::InProgress)
            .count()
    }

    /// Record a status change. Only the state machine calls this.
    pub(super) fn record(&mut self, to: Status, note: impl Into<String>, now: DateTime<Utc>) {
        self.history.push(HistoryEntry {
            at: now,
            from: self.status.state,
            to,
            note: note.into(),
        });
        self.status.state = to;
    }
}
