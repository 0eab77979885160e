//! One bounded attempt of the external agent, classified into an [`Outcome`].
//!
//! Two seams live here. [`Agent`] is a raw transport (a CLI subprocess or an
//! HTTP messages endpoint) that turns a prompt into an outcome.
//! [`AgentInvoker`] is what the run loop calls; [`Invoker`] implements it by
//! rendering the prompt, bounding the agent with a timeout and gating
//! success on the item's verification commands. The agent and the
//! verification commands share one deadline. Nothing here retries.

pub mod api;
pub mod command;
pub mod prompt;
pub mod verify;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

pub use api::ApiAgent;
pub use command::CommandAgent;

use crate::state_machine::WorkItem;
use crate::store::ProjectMeta;

/// Whatever the agent produced on success. Never inspected by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifacts(pub String);

impl Artifacts {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Classified result of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success(Artifacts),
    /// Retrying may help.
    Recoverable(String),
    /// Retrying cannot help.
    Fatal(String),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Success(_) => write!(f, "success"),
            Outcome::Recoverable(reason) => write!(f, "recoverable: {reason}"),
            Outcome::Fatal(reason) => write!(f, "fatal: {reason}"),
        }
    }
}

/// Everything an attempt needs beyond the item itself.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub repo_root: PathBuf,
    pub project: ProjectMeta,
    pub verify: Vec<String>,
    pub progress_path: PathBuf,
}

/// Raw agent transport.
#[allow(async_fn_in_trait)]
pub trait Agent {
    async fn attempt(&self, item: &WorkItem, prompt: &str, ctx: &InvocationContext) -> Outcome;
}

/// What the run loop calls once per attempt.
#[allow(async_fn_in_trait)]
pub trait AgentInvoker {
    async fn invoke(&self, item: &WorkItem, ctx: &InvocationContext) -> Outcome;
}

/// Timeout-bounded, verification-gated wrapper around an [`Agent`].
pub struct Invoker<A> {
    agent: A,
    timeout: Duration,
}

impl<A: Agent> Invoker<A> {
    /// `timeout` bounds the whole invocation, verification included.
    pub fn new(agent: A, timeout: Duration) -> Self {
        Self { agent, timeout }
    }
}

impl<A: Agent> AgentInvoker for Invoker<A> {
    async fn invoke(&self, item: &WorkItem, ctx: &InvocationContext) -> Outcome {
        if item.description.trim().is_empty() {
            return Outcome::Fatal("task description is empty".to_string());
        }

        let prompt = prompt::build(item, ctx);
        debug!(item = %item.id, prompt_len = prompt.len(), "invoking agent");

        let deadline = Instant::now() + self.timeout;
        let outcome = match timeout_at(deadline, self.agent.attempt(item, &prompt, ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(item = %item.id, timeout_secs = self.timeout.as_secs(), "agent timed out");
                return Outcome::Recoverable(format!(
                    "timeout: agent did not finish within {}s",
                    self.timeout.as_secs()
                ));
            }
        };

        let Outcome::Success(artifacts) = outcome else {
            return outcome;
        };

        if ctx.verify.is_empty() {
            info!(item = %item.id, "no verification commands configured");
            return Outcome::Success(artifacts);
        }

        match verify::run(&ctx.verify, &ctx.repo_root, deadline).await {
            Ok(()) => Outcome::Success(artifacts),
            Err(summary) => Outcome::Recoverable(format!("verification failed: {summary}")),
        }
    }
}

/// Keep the last `max` bytes of `s`, on a char boundary.
pub(crate) fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}


#[cfg(test)]
mod tests {
    use super::testing::{ScriptedAgent, context};
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn empty_description_is_fatal_without_calling_agent() {
        let tmp = TempDir::new().unwrap();
        let invoker = Invoker::new(ScriptedAgent::new(vec![]), Duration::from_secs(5));
        let item = WorkItem::new("001", "   ");

        let outcome = invoker.invoke(&item, &context(tmp.path())).await;
        assert!(matches!(outcome, Outcome::Fatal(_)));
        assert!(invoker.agent.prompts.borrow().is_empty());
    }

    #[tokio::test]
    async fn slow_agent_is_classified_as_timeout() {
        let tmp = TempDir::new().unwrap();
        let mut agent = ScriptedAgent::new(vec![]);
        agent.delay = Some(Duration::from_secs(5));
        let invoker = Invoker::new(agent, Duration::from_millis(20));

        let outcome = invoker
            .invoke(&WorkItem::new("001", "Task"), &context(tmp.path()))
            .await;
        match outcome {
            Outcome::Recoverable(reason) => assert!(reason.starts_with("timeout")),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failures_pass_through_untouched() {
        let tmp = TempDir::new().unwrap();
        let invoker = Invoker::new(
            ScriptedAgent::new(vec![Outcome::Fatal("bad task".into())]),
            Duration::from_secs(5),
        );
        let outcome = invoker
            .invoke(&WorkItem::new("001", "Task"), &context(tmp.path()))
            .await;
        assert_eq!(outcome, Outcome::Fatal("bad task".into()));
    }

    #[tokio::test]
    async fn failing_verification_turns_success_into_recoverable() {
        let tmp = TempDir::new().unwrap();
        let invoker = Invoker::new(ScriptedAgent::new(vec![]), Duration::from_secs(5));
        let mut ctx = context(tmp.path());
        ctx.verify = vec!["true".into(), "echo broken >&2; exit 3".into()];

        let outcome = invoker.invoke(&WorkItem::new("001", "Task"), &ctx).await;
        match outcome {
            Outcome::Recoverable(reason) => {
                assert!(reason.starts_with("verification failed"));
                assert!(reason.contains("broken"));
            }
            other => panic!("expected recoverable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn passing_verification_keeps_artifacts() {
        let tmp = TempDir::new().unwrap();
        let invoker = Invoker::new(
            ScriptedAgent::new(vec![Outcome::Success(Artifacts("patch".into()))]),
            Duration::from_secs(5),
        );
        let mut ctx = context(tmp.path());
        ctx.verify = vec!["true".into()];

        let outcome = invoker.invoke(&WorkItem::new("001", "Task"), &ctx).await;
        assert_eq!(outcome, Outcome::Success(Artifacts("patch".into())));
    }

    #[tokio::test]
    async fn verification_shares_the_invocation_deadline() {
        let tmp = TempDir::new().unwrap();
        let mut agent = ScriptedAgent::new(vec![]);
        agent.delay = Some(Duration::from_millis(400));
        let invoker = Invoker::new(agent, Duration::from_millis(600));
        let mut ctx = context(tmp.path());
        // Fits in 600ms on its own, but not in what the agent left over.
        ctx.verify = vec!["sleep 0.5".into()];

        let started = Instant::now();
        let outcome = invoker.invoke(&WorkItem::new("001", "Task"), &ctx).await;
        match outcome {
            Outcome::Recoverable(reason) => {
                assert!(reason.starts_with("verification failed"));
                assert!(reason.contains("timed out"));
            }
            other => panic!("expected recoverable, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_millis(850));
    }

    #[test]
    fn tail_respects_char_boundaries() {
        assert_eq!(tail("hello", 10), "hello");
        assert_eq!(tail("hello", 3), "llo");
        assert_eq!(tail("aé", 1), "");
    }
}
