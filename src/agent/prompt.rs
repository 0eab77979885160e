//! Prompt rendering for a single work item.

use std::fmt::Write;

use super::InvocationContext;
use crate::state_machine::WorkItem;

/// Render the instructions handed to the agent for `item`.
pub fn build(item: &WorkItem, ctx: &InvocationContext) -> String {
    let mut p = String::new();

    p.push_str("You are an autonomous coding agent working on a software project.\n\n");
    p.push_str("## Your Task\n\n");
    let _ = writeln!(p, "**ID:** {}", item.id);
    let _ = writeln!(p, "**Title:** {}\n", item.title);
    let _ = writeln!(p, "**Description:**\n{}\n", item.description.trim());

    if !item.acceptance_criteria.is_empty() {
        p.push_str("**Acceptance Criteria:**\n");
        push_list(&mut p, &item.acceptance_criteria, |c| c.to_string());
        p.push('\n');
    }

    if !item.files_hint.is_empty() {
        p.push_str("**Files to focus on:**\n");
        push_list(&mut p, &item.files_hint, |f| f.to_string());
        p.push('\n');
    }

    p.push_str("## Project Context\n\n");
    let _ = writeln!(p, "- **Project Name:** {}", ctx.project.name);
    let _ = writeln!(p, "- **Language:** {}", ctx.project.language);
    let _ = writeln!(p, "- **Default Branch:** {}\n", ctx.project.default_branch);

    p.push_str(
        "## Rules\n\n\
         1. Make minimal, focused changes to implement the task\n\
         2. Do NOT mark the item as done; the harness does that after verification\n\
         3. Update or create tests to cover your changes\n\
         4. Leave the codebase building and running\n\
         5. Follow the existing code style and conventions\n\
         6. If you hit a blocker, document it clearly\n\n",
    );

    if !ctx.verify.is_empty() {
        p.push_str("## Verification Commands\n\n");
        p.push_str("These commands run after your session; all must pass:\n");
        push_list(&mut p, &ctx.verify, |c| format!("`{c}`"));
        p.push('\n');
    }

    p.push_str("## Long-term Memory\n\n");
    let _ = writeln!(
        p,
        "You may read and append to `{}` to keep context across sessions: \
         decisions, issues you ran into, partial progress, notes for the next attempt.\n",
        ctx.progress_path.display()
    );

    p.push_str(
        "## Instructions\n\n\
         Implement the task above so that every acceptance criterion holds. \
         When you are done, finish your session; do not try to mark the task complete.\n",
    );

    p
}

fn push_list<T>(p: &mut String, items: &[T], render: impl Fn(&T) -> String) {
    for item in items {
        let _ = writeln!(p, "- {}", render(item));
    }
}
