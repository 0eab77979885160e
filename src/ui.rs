//! Terminal output: a spinner for the running attempt, colored outcome
//! lines, the status table and the end-of-session summary.
//!
//! Built on `indicatif` for the spinner and `console` for styling. During a
//! run everything is derived from the store's status snapshots, so the run
//! loop never talks to the terminal directly.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinHandle;

use crate::state_machine::{RunSession, SessionOutcome, SessionSummary, Status, StatusCounts};
use crate::store::{ItemSummary, StatusReader, StatusSnapshot};

/// Something worth telling the user, found by comparing two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Change<'a> {
    Started(&'a ItemSummary),
    Retrying(&'a ItemSummary),
    Done(&'a ItemSummary),
    Failed(&'a ItemSummary),
    Blocked(&'a ItemSummary),
}

fn changes<'a>(prev: &StatusSnapshot, next: &'a StatusSnapshot) -> Vec<Change<'a>> {
    let mut out = Vec::new();
    for item in &next.items {
        let before = prev.items.iter().find(|p| p.id == item.id);
        let (was, attempts_before) = before.map_or((Status::Pending, 0), |p| (p.status, p.attempts));
        if was == item.status && attempts_before == item.attempts {
            continue;
        }
        let change = match item.status {
            Status::InProgress => Change::Started(item),
            Status::Done => Change::Done(item),
            Status::Failed => Change::Failed(item),
            Status::Blocked => Change::Blocked(item),
            Status::Pending if item.attempts > 0 && item.last_error.is_some() => {
                Change::Retrying(item)
            }
            Status::Pending => continue,
        };
        out.push(change);
    }
    out
}

/// Live view of a session, fed by status snapshots.
pub struct SessionProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl SessionProgress {
    pub fn start() -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message("starting session");
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    fn update(&self, prev: &StatusSnapshot, next: &StatusSnapshot) {
        for change in changes(prev, next) {
            match change {
                Change::Started(item) => {
                    self.pb
                        .set_message(format!("{} (attempt {}): {}", item.id, item.attempts, item.title));
                }
                Change::Retrying(item) => self.pb.println(format!(
                    "  {} {} attempt {} failed: {}",
                    self.yellow.apply_to("↻"),
                    item.id,
                    item.attempts,
                    item.last_error.as_deref().unwrap_or("unknown error")
                )),
                Change::Done(item) => self.pb.println(format!(
                    "  {} {} {}",
                    self.green.apply_to("✓"),
                    item.id,
                    item.title
                )),
                Change::Failed(item) => self.pb.println(format!(
                    "  {} {} failed after {} attempt(s): {}",
                    self.red.apply_to("✗"),
                    item.id,
                    item.attempts,
                    item.last_error.as_deref().unwrap_or("unknown error")
                )),
                Change::Blocked(item) => self.pb.println(format!(
                    "  {}",
                    self.dim.apply_to(format!("… {} waiting on dependencies", item.id))
                )),
            }
        }
        if next.in_progress().is_none() {
            self.pb.set_message("idle");
        }
    }

    pub fn finish(&self) {
        self.pb.finish_and_clear();
    }
}

/// Render snapshots from `reader` until the store is dropped.
pub fn spawn_progress(mut reader: StatusReader) -> JoinHandle<()> {
    tokio::spawn(async move {
        let progress = SessionProgress::start();
        let mut prev = reader.borrow_and_update().clone();
        while reader.changed().await.is_ok() {
            let next = reader.borrow_and_update().clone();
            progress.update(&prev, &next);
            prev = next;
        }
        progress.finish();
    })
}

fn status_style(status: Status) -> Style {
    match status {
        Status::Done => Style::new().green(),
        Status::Failed => Style::new().red(),
        Status::InProgress => Style::new().cyan(),
        Status::Blocked => Style::new().yellow(),
        Status::Pending => Style::new().dim(),
    }
}

fn counts_line(counts: &StatusCounts) -> String {
    Status::ALL
        .iter()
        .map(|&s| format!("{s}: {}", counts.get(s)))
        .collect::<Vec<_>>()
        .join("  ")
}

/// Table of every item followed by per-status counts.
pub fn print_status(snapshot: &StatusSnapshot) {
    let id_width = snapshot
        .items
        .iter()
        .map(|i| i.id.len())
        .max()
        .unwrap_or(2)
        .max(2);
    let bold = Style::new().bold();

    println!(
        "{}",
        bold.apply_to(format!("{:<id_width$}  {:<11}  {:>8}  TITLE", "ID", "STATUS", "ATTEMPTS"))
    );
    for item in &snapshot.items {
        let status = format!("{:<11}", item.status.to_string());
        println!(
            "{:<id_width$}  {}  {:>8}  {}",
            item.id,
            status_style(item.status).apply_to(status),
            item.attempts,
            item.title
        );
        if let Some(err) = &item.last_error
            && item.status != Status::Done
        {
            println!("{:<id_width$}  {}", "", Style::new().dim().apply_to(err));
        }
    }
    println!();
    println!("{}", counts_line(&snapshot.counts));
}

/// Warning for a session that never closed, e.g. after a forced exit.
fn open_session_notice(sessions: &[RunSession]) -> Option<String> {
    let open = sessions.iter().rev().find(|s| s.is_open())?;
    Some(format!(
        "session {} (started {}) was not closed; the next run records it as interrupted",
        open.session_id,
        open.started_at.to_rfc3339()
    ))
}

pub fn print_open_session(sessions: &[RunSession]) {
    if let Some(notice) = open_session_notice(sessions) {
        println!();
        println!("{} {notice}", Style::new().yellow().bold().apply_to("!"));
    }
}

pub fn print_summary(summary: &SessionSummary) {
    let style = match summary.outcome {
        SessionOutcome::CompletedAll => Style::new().green().bold(),
        SessionOutcome::Interrupted => Style::new().yellow().bold(),
        SessionOutcome::PartiallyBlocked | SessionOutcome::AbortedOnFatal => {
            Style::new().red().bold()
        }
    };
    println!();
    println!("{}", style.apply_to(format!("─── Session {} ───", summary.outcome)));
    println!("{}", counts_line(&summary.counts));
    println!("agent invocations: {}", summary.invocations);
}
