//! Post-attempt verification commands.

use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use super::tail;

const STDERR_TAIL: usize = 200;

/// Run `commands` in order in `repo_root`, stopping at the first failure.
///
/// Every command must exit 0 before `deadline`, which is shared with the
/// agent attempt that preceded it. Returns a one-line summary of the
/// failing command on error.
pub async fn run(commands: &[String], repo_root: &Path, deadline: Instant) -> Result<(), String> {
    for cmd in commands {
        info!(command = %cmd, "running verification");
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(repo_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout_at(deadline, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(format!("{cmd}: failed to start: {e}")),
            Err(_) => {
                warn!(command = %cmd, "verification ran past the invocation deadline");
                return Err(format!("{cmd}: timed out at the invocation deadline"));
            }
        };

        if output.status.success() {
            debug!(command = %cmd, "verification passed");
            continue;
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output
            .status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        return Err(format!(
            "{cmd} (exit {code}): {}",
            tail(stderr.trim(), STDERR_TAIL)
        ));
    }
    Ok(())
}
