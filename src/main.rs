mod agent;
mod checkpoint;
mod cli;
mod config;
mod error;
mod exit_codes;
mod git;
mod logging;
mod orchestrator;
mod progress;
mod state_machine;
mod store;
mod ui;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use agent::{ApiAgent, CommandAgent, Invoker};
use checkpoint::{Checkpoint, NoCheckpoint};
use cli::{Cli, Command};
use config::{AgentKind, HarnessConfig};
use error::HarnessError;
use git::GitCheckpoint;
use orchestrator::{CancelFlag, RunLoop};
use store::{RALPH_DIR, StateStore, StatusSnapshot, prd_path};

const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let code = match dispatch(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", console::style("error:").red().bold());
            exit_code_for(&e)
        }
    };
    std::process::exit(code);
}

/// Missing or malformed input is distinguished from a failed session.
fn exit_code_for(e: &anyhow::Error) -> i32 {
    let invalid_state = e.downcast_ref::<HarnessError>().is_some_and(|h| {
        matches!(h, HarnessError::NotFound(_) | HarnessError::CorruptState { .. })
    });
    if invalid_state || e.downcast_ref::<toml::de::Error>().is_some() {
        exit_codes::INVALID
    } else {
        exit_codes::INCOMPLETE
    }
}

async fn dispatch(cli: &Cli) -> Result<i32> {
    let repo_root = cli.repo.as_path();
    match cli.command {
        Command::Validate => {
            let store = StateStore::load(prd_path(repo_root))?;
            let counts = store.counts();
            println!(
                "{} {} ({} items)",
                console::style("✓").green().bold(),
                store.path().display(),
                counts.total()
            );
            Ok(exit_codes::OK)
        }
        Command::Status => {
            let store = StateStore::load(prd_path(repo_root))?;
            ui::print_status(&StatusSnapshot::from_items(store.items()));
            ui::print_open_session(&store.document().sessions);
            Ok(exit_codes::OK)
        }
        Command::Run => {
            let mut config = HarnessConfig::load(&repo_root.join(RALPH_DIR))?;
            cli.apply_overrides(&mut config);
            run(repo_root, &config).await
        }
    }
}

async fn run(repo_root: &Path, config: &HarnessConfig) -> Result<i32> {
    let store = StateStore::load(prd_path(repo_root))?;

    if config.commit {
        match GitCheckpoint::open(repo_root) {
            Ok(git) => {
                if let Ok(branch) = git.current_branch() {
                    info!(branch = %branch, "committing completed items");
                }
                return run_with(repo_root, store, config, git).await;
            }
            Err(e) => warn!(error = %e, "not a git repository, checkpoints disabled"),
        }
    }
    run_with(repo_root, store, config, NoCheckpoint).await
}

async fn run_with<C: Checkpoint>(
    repo_root: &Path,
    store: StateStore,
    config: &HarnessConfig,
    checkpoint: C,
) -> Result<i32> {
    let model = config
        .agent
        .model
        .clone()
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
    let timeout = config.invocation_timeout();

    match config.agent.kind {
        AgentKind::Command => {
            let agent = CommandAgent::new(config.agent.command.clone(), model)
                .with_fatal_exit_codes(config.agent.fatal_exit_codes.clone())
                .streaming(config.agent.stream_output);
            drive(repo_root, store, config, Invoker::new(agent, timeout), checkpoint).await
        }
        AgentKind::Api => {
            if config.agent.api_key.is_empty() {
                anyhow::bail!("the api agent needs ANTHROPIC_API_KEY or agent.api_key in config.toml");
            }
            let agent = ApiAgent::with_base_url(
                config.agent.api_key.clone(),
                model,
                config.agent.max_tokens,
                config.agent.api_url.clone(),
            )?;
            drive(repo_root, store, config, Invoker::new(agent, timeout), checkpoint).await
        }
    }
}

async fn drive<I: agent::AgentInvoker, C: Checkpoint>(
    repo_root: &Path,
    store: StateStore,
    config: &HarnessConfig,
    invoker: I,
    checkpoint: C,
) -> Result<i32> {
    let cancel = CancelFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current attempt");
            on_signal.cancel();
            // A second interrupt does not wait. The session stays open on
            // disk; `ralph status` reports it and the next run closes it.
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(exit_codes::INTERRUPTED);
            }
        }
    });

    let progress = ui::spawn_progress(store.subscribe());
    let mut run_loop = RunLoop::new(repo_root, store, invoker, checkpoint)
        .with_policy(config.retry_policy())
        .with_max_iterations(config.max_iterations)
        .with_cancel_flag(cancel);

    let result = run_loop.run().await;
    // Dropping the store closes the status channel and ends the spinner.
    drop(run_loop);
    if let Err(e) = progress.await {
        warn!(error = %e, "progress display task failed");
    }

    let summary = result.context("session aborted")?;
    ui::print_summary(&summary);
    Ok(exit_codes::for_summary(&summary))
}
