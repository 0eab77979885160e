//! The run loop: picks the next eligible work item, invokes the agent,
//! commits the outcome and repeats until nothing is left to run.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::agent::{AgentInvoker, Artifacts, InvocationContext, Outcome};
use crate::checkpoint::Checkpoint;
use crate::error::{HarnessError, Result};
use crate::progress::ProgressLog;
use crate::state_machine::{
    Event, FailureKind, RetryPolicy, SessionOutcome, SessionSummary, StateMachine, Status,
    Transition, WorkItem,
};
use crate::store::StateStore;

/// Longest uninterrupted sleep while waiting out a backoff window.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Cooperative cancellation, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the next iteration works on.
enum Work {
    /// An item left `InProgress` by a crashed run; its attempt is already counted.
    Resume(WorkItem),
    Start(String),
}

/// Drives every item of the store to a terminal status, one at a time.
pub struct RunLoop<I, C> {
    repo_root: PathBuf,
    store: StateStore,
    invoker: I,
    checkpoint: C,
    policy: RetryPolicy,
    max_iterations: u32,
    cancel: CancelFlag,
    progress: ProgressLog,
    invocations: u32,
}

impl<I: AgentInvoker, C: Checkpoint> RunLoop<I, C> {
    pub fn new(repo_root: impl Into<PathBuf>, store: StateStore, invoker: I, checkpoint: C) -> Self {
        let ralph_dir = store
            .path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Self {
            repo_root: repo_root.into(),
            store,
            invoker,
            checkpoint,
            policy: RetryPolicy::default(),
            max_iterations: u32::MAX,
            cancel: CancelFlag::new(),
            progress: ProgressLog::new(&ralph_dir),
            invocations: 0,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Cap on agent invocations per session.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Run one session.
    ///
    /// Every normal exit closes the session. On a store failure the session
    /// is closed as [`SessionOutcome::AbortedOnFatal`] if the store still
    /// accepts the write; otherwise it stays open on disk and the next
    /// session closes it as [`SessionOutcome::Interrupted`].
    pub async fn run(&mut self) -> Result<SessionSummary> {
        let session_id = self.store.open_session(Utc::now())?;
        let counts = self.store.counts();
        info!(session = %session_id, items = counts.total(), done = counts.done, "session started");
        self.progress.append(&format!("=== Session {session_id} started ==="));

        let outcome = match self.drive().await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(session = %session_id, error = %e, "session aborted");
                self.progress.append(&format!("Session aborted: {e}"));
                if let Err(close_err) =
                    self.store
                        .close_session(session_id, SessionOutcome::AbortedOnFatal, Utc::now())
                {
                    warn!(error = %close_err, "failed to close aborted session");
                }
                return Err(e);
            }
        };

        self.store.close_session(session_id, outcome, Utc::now())?;
        let counts = self.store.counts();
        info!(
            session = %session_id,
            outcome = %outcome,
            invocations = self.invocations,
            done = counts.done,
            failed = counts.failed,
            blocked = counts.blocked,
            pending = counts.pending,
            "session ended"
        );
        self.progress.append(&format!(
            "=== Session ended: {outcome} ({} done, {} failed, {} blocked, {} pending) ===",
            counts.done, counts.failed, counts.blocked, counts.pending
        ));

        Ok(SessionSummary {
            session_id,
            outcome,
            counts,
            invocations: self.invocations,
        })
    }

    async fn drive(&mut self) -> Result<SessionOutcome> {
        loop {
            if self.cancel.is_cancelled() {
                info!("cancellation requested, stopping between iterations");
                return Ok(SessionOutcome::Interrupted);
            }

            self.reclassify()?;

            let Some(work) = self.next_work(Utc::now()) else {
                if let Some(deadline) = self.next_retry_at() {
                    debug!(until = %deadline, "waiting for backoff to elapse");
                    self.wait_until(deadline).await;
                    continue;
                }
                return Ok(self.final_outcome());
            };

            if self.invocations >= self.max_iterations {
                warn!(max_iterations = self.max_iterations, "iteration cap reached");
                return Ok(SessionOutcome::Interrupted);
            }

            let item = match work {
                Work::Resume(item) => {
                    info!(item = %item.id, attempt = item.status.attempts, "resuming interrupted attempt");
                    item
                }
                Work::Start(id) => match self.select(&id)? {
                    Some(item) => item,
                    None => continue,
                },
            };
            self.attempt(item).await?;
        }
    }

    fn next_work(&self, now: DateTime<Utc>) -> Option<Work> {
        if let Some(item) = self
            .store
            .items()
            .iter()
            .find(|i| i.state() == Status::InProgress)
        {
            return Some(Work::Resume(item.clone()));
        }
        self.store
            .list_eligible(now)
            .next()
            .map(|item| Work::Start(item.id.clone()))
    }

    /// Park Pending items behind unfinished dependencies and release Blocked
    /// items whose dependencies are all done.
    fn reclassify(&mut self) -> Result<()> {
        let now = Utc::now();
        let mut changed = Vec::new();

        for item in self.store.items() {
            let waiting_on = self.store.unmet_dependencies(item);
            let event = match item.state() {
                Status::Pending if !waiting_on.is_empty() => Event::DependencyUnmet { waiting_on },
                Status::Blocked if waiting_on.is_empty() => Event::DependenciesMet,
                _ => continue,
            };
            let mut next = item.clone();
            StateMachine::apply(&mut next, event, &self.policy, now)?;
            changed.push(next);
        }

        for item in changed {
            debug!(item = %item.id, status = %item.state(), "dependency state changed");
            self.store.commit(item)?;
        }
        Ok(())
    }

    /// Move `id` to `InProgress`. An item whose dependencies turn out to be
    /// unfinished is parked as `Blocked` instead and `None` is returned.
    fn select(&mut self, id: &str) -> Result<Option<WorkItem>> {
        let mut item = self
            .store
            .get(id)
            .cloned()
            .ok_or_else(|| HarnessError::ItemNotFound(id.to_string()))?;
        let waiting_on = self.store.unmet_dependencies(&item);
        let now = Utc::now();
        let select = Event::Select {
            dependencies_met: waiting_on.is_empty(),
        };

        match StateMachine::apply(&mut item, select, &self.policy, now) {
            Ok(_) => {}
            Err(HarnessError::DependenciesUnmet { .. }) => {
                debug!(item = %item.id, "selected with unfinished dependencies, blocking");
                StateMachine::apply(&mut item, Event::DependencyUnmet { waiting_on }, &self.policy, now)?;
                self.store.commit(item)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        self.store.commit(item.clone())?;

        info!(item = %item.id, attempt = item.status.attempts, "starting item");
        self.progress.append(&format!(
            "Starting {} (attempt {}): {}",
            item.id, item.status.attempts, item.title
        ));
        Ok(Some(item))
    }

    async fn attempt(&mut self, mut item: WorkItem) -> Result<()> {
        let ctx = self.context_for(&item);
        self.invocations += 1;
        let attempt = item.status.attempts;

        let outcome = self.invoker.invoke(&item, &ctx).await;
        debug!(item = %item.id, attempt, outcome = %outcome, "attempt finished");

        let (event, artifacts) = match outcome {
            Outcome::Success(artifacts) => (Event::AgentSucceeded, artifacts),
            Outcome::Recoverable(reason) => (
                Event::AgentFailed(FailureKind::Recoverable(reason)),
                Artifacts::default(),
            ),
            Outcome::Fatal(reason) => (
                Event::AgentFailed(FailureKind::Fatal(reason)),
                Artifacts::default(),
            ),
        };

        let transition = StateMachine::apply(&mut item, event, &self.policy, Utc::now())?;
        self.store.commit(item.clone())?;

        match transition {
            Transition::Complete(Status::Done) => {
                info!(item = %item.id, attempt, "item done");
                self.progress
                    .append(&format!("Completed {}: {}", item.id, item.title));
                self.checkpoint_item(&item, &artifacts);
            }
            Transition::Retry { not_before, reason } => {
                warn!(
                    item = %item.id,
                    attempt,
                    budget = self.policy.retry_budget,
                    retry_at = %not_before,
                    reason = %reason.message(),
                    "attempt failed, will retry"
                );
                self.progress.append(&format!(
                    "{} failed (attempt {attempt}), retrying: {}",
                    item.id,
                    reason.message()
                ));
            }
            Transition::Complete(_) => {
                let reason = item
                    .status
                    .last_error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default();
                error!(item = %item.id, attempt, reason = %reason, "item failed");
                self.progress
                    .append(&format!("{} failed after {attempt} attempt(s): {reason}", item.id));
            }
            Transition::Next(status) => {
                debug!(item = %item.id, status = %status, "unexpected non-terminal outcome");
            }
        }
        Ok(())
    }

    fn checkpoint_item(&self, item: &WorkItem, artifacts: &Artifacts) {
        match self.checkpoint.checkpoint(item, artifacts) {
            Ok(Some(id)) => {
                info!(item = %item.id, checkpoint = %id, "checkpoint recorded");
                self.progress
                    .append(&format!("Checkpoint {id} for {}", item.id));
            }
            Ok(None) => debug!(item = %item.id, "nothing to checkpoint"),
            Err(e) => warn!(item = %item.id, error = %e, "checkpoint failed"),
        }
    }

    fn context_for(&self, item: &WorkItem) -> InvocationContext {
        InvocationContext {
            repo_root: self.repo_root.clone(),
            project: self.store.document().project.clone(),
            verify: self.store.verify_commands(item),
            progress_path: self.progress.path().to_path_buf(),
        }
    }

    /// Earliest end of a backoff window among Pending items.
    fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.store
            .items()
            .iter()
            .filter(|i| i.state() == Status::Pending)
            .filter_map(|i| i.status.not_before)
            .min()
    }

    /// Sleep until `deadline` in short slices, returning early on cancellation.
    async fn wait_until(&self, deadline: DateTime<Utc>) {
        while !self.cancel.is_cancelled() {
            let Ok(remaining) = (deadline - Utc::now()).to_std() else {
                return;
            };
            if remaining.is_zero() {
                return;
            }
            sleep(remaining.min(POLL_INTERVAL)).await;
        }
    }

    fn final_outcome(&self) -> SessionOutcome {
        let items = self.store.items();
        if items.iter().all(|i| i.state() == Status::Done) {
            SessionOutcome::CompletedAll
        } else if items.iter().any(|i| {
            i.state() == Status::Failed
                && i.status.last_error.as_ref().is_some_and(FailureKind::is_fatal)
        }) {
            SessionOutcome::AbortedOnFatal
        } else {
            SessionOutcome::PartiallyBlocked
        }
    }
}
