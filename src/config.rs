//! Harness configuration loaded from `.ralph/config.toml`.
//!
//! [`HarnessConfig`] holds every tunable. Missing fields (or a missing file)
//! fall back to defaults. `ANTHROPIC_API_KEY` takes precedence over the
//! file's `api_key`, and CLI flags take precedence over both.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::state_machine::RetryPolicy;

pub const CONFIG_FILE: &str = "config.toml";

/// Which transport carries agent attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Spawn an agent CLI per attempt.
    Command,
    /// Call a messages HTTP endpoint per attempt.
    Api,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_kind")]
    pub kind: AgentKind,

    /// Model name substituted for `{model}` or sent to the API.
    #[serde(default)]
    pub model: Option<String>,

    /// Argument template for [`AgentKind::Command`].
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    /// Exit codes that mean "retrying cannot help".
    #[serde(default)]
    pub fatal_exit_codes: Vec<i32>,

    /// Let the agent CLI write to the terminal instead of capturing output.
    #[serde(default)]
    pub stream_output: bool,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HarnessConfig {
    /// Attempts per item before a recoverable failure becomes terminal.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Upper bound for one invocation: the agent attempt plus its
    /// verification commands.
    #[serde(default = "default_invocation_timeout_secs")]
    pub invocation_timeout_secs: u64,

    /// Agent invocations allowed in one session.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Commit to git after every completed item.
    #[serde(default = "default_commit")]
    pub commit: bool,

    #[serde(default)]
    pub agent: AgentConfig,
}

fn default_agent_kind() -> AgentKind {
    AgentKind::Command
}

fn default_command() -> Vec<String> {
    ["opencode", "-m", "{model}", "run", "{prompt}"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_api_url() -> String {
    crate::agent::api::API_URL.to_string()
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_retry_budget() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_invocation_timeout_secs() -> u64 {
    30 * 60
}

fn default_max_iterations() -> u32 {
    50
}

fn default_commit() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kind: default_agent_kind(),
            model: None,
            command: default_command(),
            fatal_exit_codes: Vec::new(),
            stream_output: false,
            api_key: String::new(),
            api_url: default_api_url(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            retry_budget: default_retry_budget(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            invocation_timeout_secs: default_invocation_timeout_secs(),
            max_iterations: default_max_iterations(),
            commit: default_commit(),
            agent: AgentConfig::default(),
        }
    }
}

impl HarnessConfig {
    /// Load `config.toml` from `ralph_dir`, or defaults if it does not exist.
    pub fn load(ralph_dir: &Path) -> Result<Self> {
        let path = ralph_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<HarnessConfig>(&contents)
                .with_context(|| format!("invalid config {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(key) = std::env::var("ANTHROPIC_API_KEY")
            && !key.is_empty()
        {
            config.agent.api_key = key;
        }

        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retry_budget: self.retry_budget,
            backoff_base_ms: self.backoff_base_ms,
            backoff_cap_ms: self.backoff_cap_ms,
        }
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_secs(self.invocation_timeout_secs)
    }
}
