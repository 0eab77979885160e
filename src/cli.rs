//! Command-line interface built on clap.
//!
//! [`Cli`] holds the subcommands ([`Command`]: run, status, validate) and the
//! global flags that override `.ralph/config.toml`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::{AgentKind, HarnessConfig};

/// ralph: drive a coding agent through a PRD, one work item at a time.
#[derive(Debug, Parser)]
#[command(name = "ralph", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Repository root containing `.ralph/prd.json`.
    #[arg(long, short = 'C', global = true, default_value = ".")]
    pub repo: PathBuf,

    /// Model passed to the agent.
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Attempts per item before a recoverable failure is final.
    #[arg(long, global = true)]
    pub retry_budget: Option<u32>,

    /// Timeout for one agent attempt, in seconds.
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,

    /// Maximum agent invocations in this session.
    #[arg(long, global = true)]
    pub max_iterations: Option<u32>,

    /// Do not create a git commit after each completed item.
    #[arg(long, global = true, default_value_t = false)]
    pub no_commit: bool,

    /// Agent transport.
    #[arg(long, global = true)]
    pub agent: Option<AgentKind>,

    /// Verbose diagnostics on stderr.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Work through the PRD until every item is done or nothing can run.
    Run,

    /// Show the status of every item.
    Status,

    /// Check that the PRD parses and its dependency graph is sound.
    Validate,
}

impl Cli {
    /// Apply flag overrides on top of the loaded configuration.
    pub fn apply_overrides(&self, config: &mut HarnessConfig) {
        if let Some(model) = &self.model {
            config.agent.model = Some(model.clone());
        }
        if let Some(budget) = self.retry_budget {
            config.retry_budget = budget;
        }
        if let Some(secs) = self.timeout_secs {
            config.invocation_timeout_secs = secs;
        }
        if let Some(max) = self.max_iterations {
            config.max_iterations = max;
        }
        if self.no_commit {
            config.commit = false;
        }
        if let Some(kind) = self.agent {
            config.agent.kind = kind;
        }
    }
}
