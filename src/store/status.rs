//! Read-only status surface fed by the store after every commit.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::state_machine::{Status, StatusCounts, WorkItem};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemSummary {
    pub id: String,
    pub title: String,
    pub status: Status,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
}

impl From<&WorkItem> for ItemSummary {
    fn from(item: &WorkItem) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            status: item.state(),
            attempts: item.status.attempts,
            last_error: item.status.last_error.as_ref().map(|e| e.message().to_string()),
            not_before: item.status.not_before,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub items: Vec<ItemSummary>,
    pub counts: StatusCounts,
}

impl StatusSnapshot {
    pub fn from_items(items: &[WorkItem]) -> Self {
        Self {
            items: items.iter().map(ItemSummary::from).collect(),
            counts: StatusCounts::tally(items),
        }
    }

    /// The item currently being attempted, if any.
    pub fn in_progress(&self) -> Option<&ItemSummary> {
        self.items.iter().find(|i| i.status == Status::InProgress)
    }
}

/// Receiving half handed to reporting surfaces. Reading it never blocks the
/// writer; each `borrow` sees the latest committed snapshot.
pub type StatusReader = watch::Receiver<StatusSnapshot>;
