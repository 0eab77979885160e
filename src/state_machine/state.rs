use std::fmt;

use chrono::{DateTime, Utc};

use super::item::{FailureKind, RetryPolicy, Status, WorkItem};
use crate::error::{HarnessError, Result};

/// Inputs that drive a work item through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The run loop picked the item for its next attempt.
    Select { dependencies_met: bool },
    AgentSucceeded,
    AgentFailed(FailureKind),
    /// A dependency is not done yet; park the item.
    DependencyUnmet { waiting_on: Vec<String> },
    /// Every dependency reached `Done`.
    DependenciesMet,
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Select { .. } => write!(f, "select"),
            Event::AgentSucceeded => write!(f, "agent_succeeded"),
            Event::AgentFailed(_) => write!(f, "agent_failed"),
            Event::DependencyUnmet { .. } => write!(f, "dependency_unmet"),
            Event::DependenciesMet => write!(f, "dependencies_met"),
        }
    }
}

/// The result of applying an event to an item.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Moved to a non-terminal status.
    Next(Status),
    /// Failed but within budget: back to `Pending` until `not_before`.
    Retry {
        not_before: DateTime<Utc>,
        reason: FailureKind,
    },
    /// Reached `Done` or `Failed`.
    Complete(Status),
}

/// Transition rules for a single work item.
pub struct StateMachine;

impl StateMachine {
    /// Compute the status `event` leads to, without touching the item.
    ///
    /// A select with unmet dependencies is rejected with
    /// [`HarnessError::DependenciesUnmet`]; the caller must park the item as
    /// `Blocked` instead. Any other pair the table does not list, including
    /// everything from a terminal status, is an illegal transition.
    pub fn next_status(item: &WorkItem, event: &Event, policy: &RetryPolicy) -> Result<Status> {
        let from = item.state();
        let to = match (from, event) {
            (Status::Pending, Event::Select { dependencies_met }) => {
                if !dependencies_met {
                    return Err(HarnessError::DependenciesUnmet {
                        id: item.id.clone(),
                        pending: item.depends_on.join(", "),
                    });
                }
                Status::InProgress
            }
            (Status::InProgress, Event::AgentSucceeded) => Status::Done,
            (Status::InProgress, Event::AgentFailed(kind)) => {
                if kind.is_fatal() || policy.budget_exhausted(item.status.attempts) {
                    Status::Failed
                } else {
                    Status::Pending
                }
            }
            (Status::Pending, Event::DependencyUnmet { .. }) => Status::Blocked,
            (Status::Blocked, Event::DependenciesMet) => Status::Pending,
            _ => {
                return Err(HarnessError::IllegalTransition {
                    id: item.id.clone(),
                    from,
                    event: event.clone(),
                });
            }
        };
        Ok(to)
    }

    /// Apply `event` to `item`, appending exactly one history entry.
    ///
    /// On error the item is left untouched.
    pub fn apply(
        item: &mut WorkItem,
        event: Event,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        let to = Self::next_status(item, &event, policy)?;

        let transition = match event {
            Event::Select { .. } => {
                item.status.attempts += 1;
                item.status.not_before = None;
                let note = format!("attempt {}", item.status.attempts);
                item.record(to, note, now);
                Transition::Next(to)
            }
            Event::AgentSucceeded => {
                item.status.last_error = None;
                item.status.done_at = Some(now);
                item.record(to, "agent succeeded", now);
                Transition::Complete(to)
            }
            Event::AgentFailed(kind) => {
                item.record(to, kind.to_string(), now);
                item.status.last_error = Some(kind.clone());
                if to == Status::Failed {
                    Transition::Complete(to)
                } else {
                    let delay = policy.delay_for_attempt(item.status.attempts);
                    let not_before = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|d| now.checked_add_signed(d))
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    item.status.not_before = Some(not_before);
                    Transition::Retry {
                        not_before,
                        reason: kind,
                    }
                }
            }
            Event::DependencyUnmet { waiting_on } => {
                item.record(to, format!("waiting on {}", waiting_on.join(", ")), now);
                Transition::Next(to)
            }
            Event::DependenciesMet => {
                item.record(to, "dependencies done", now);
                Transition::Next(to)
            }
        };

        Ok(transition)
    }
}
