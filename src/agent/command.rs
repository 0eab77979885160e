//! Agent run as a CLI subprocess, e.g. `opencode -m <model> run <prompt>`.

use std::io::ErrorKind;
use std::process::{ExitStatus, Stdio};

use tokio::process::Command;
use tracing::{debug, instrument, warn};

use super::{Agent, Artifacts, InvocationContext, Outcome, tail};
use crate::state_machine::WorkItem;

const ARTIFACT_TAIL: usize = 2000;
const ERROR_TAIL: usize = 500;

/// Spawns the agent CLI once per attempt.
///
/// The argument template may contain `{model}`, `{id}` and `{prompt}`
/// placeholders. Exit code 0 is success; codes listed in
/// `fatal_exit_codes` are fatal; anything else is recoverable.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    template: Vec<String>,
    model: String,
    fatal_exit_codes: Vec<i32>,
    stream_output: bool,
}

impl CommandAgent {
    pub fn new(template: Vec<String>, model: impl Into<String>) -> Self {
        Self {
            template,
            model: model.into(),
            fatal_exit_codes: Vec::new(),
            stream_output: false,
        }
    }

    pub fn with_fatal_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.fatal_exit_codes = codes;
        self
    }

    /// Let the agent write straight to the terminal instead of capturing.
    pub fn streaming(mut self, stream_output: bool) -> Self {
        self.stream_output = stream_output;
        self
    }

    /// Substitute placeholders. `{prompt}` goes last so prompt text is never
    /// re-expanded.
    fn argv(&self, item: &WorkItem, prompt: &str) -> Vec<String> {
        self.template
            .iter()
            .map(|arg| {
                arg.replace("{model}", &self.model)
                    .replace("{id}", &item.id)
                    .replace("{prompt}", prompt)
            })
            .collect()
    }

    fn classify(&self, status: ExitStatus, stdout: &[u8], stderr: &[u8]) -> Outcome {
        if status.success() {
            let stdout = String::from_utf8_lossy(stdout);
            return Outcome::Success(Artifacts(tail(&stdout, ARTIFACT_TAIL).to_string()));
        }

        let stderr = String::from_utf8_lossy(stderr);
        let detail = tail(stderr.trim(), ERROR_TAIL);
        match status.code() {
            Some(code) if self.fatal_exit_codes.contains(&code) => {
                Outcome::Fatal(format!("agent exited with fatal code {code}: {detail}"))
            }
            Some(code) => Outcome::Recoverable(format!("agent exit code {code}: {detail}")),
            None => Outcome::Recoverable(format!("agent terminated by signal: {detail}")),
        }
    }
}

impl Agent for CommandAgent {
    #[instrument(skip_all, fields(item = %item.id))]
    async fn attempt(&self, item: &WorkItem, prompt: &str, ctx: &InvocationContext) -> Outcome {
        let argv = self.argv(item, prompt);
        let Some((program, args)) = argv.split_first() else {
            return Outcome::Fatal("agent command is empty".to_string());
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&ctx.repo_root)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if self.stream_output {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }

        // The prompt can be huge; keep the log line short.
        debug!(program = %program, model = %self.model, "spawning agent");
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Outcome::Fatal(format!("agent executable `{program}` not found"));
            }
            Err(e) => return Outcome::Recoverable(format!("failed to spawn agent: {e}")),
        };

        match child.wait_with_output().await {
            Ok(output) => {
                debug!(exit_code = ?output.status.code(), "agent finished");
                self.classify(output.status, &output.stdout, &output.stderr)
            }
            Err(e) => {
                warn!(error = %e, "failed waiting for agent");
                Outcome::Recoverable(format!("failed waiting for agent: {e}"))
            }
        }
    }
}
