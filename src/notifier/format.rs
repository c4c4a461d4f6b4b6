//! Check-run summary rendering.
//!
//! Summaries are GitHub-flavoured markdown. Fixed summaries are used when the
//! deployer refuses or short-circuits a revision; workflow summaries are
//! rendered from each `WorkflowState` update.

use crate::types::{DeploymentInfo, Job, JobStatus, WorkflowMode, WorkflowState};
use crate::worker::queue::LockState;

/// GitHub rejects check-run summaries longer than this.
pub const MAX_SUMMARY_LEN: usize = 65535;

/// Room left for the surrounding markdown when embedding command output.
const MAX_OUTPUT_LEN: usize = 60_000;

pub const DIRECTION_BEHIND_SUMMARY: &str = "This revision is behind the revision currently deployed for this root. \
Deploying it would roll the root back, so it has been skipped.\n\n\
To roll back on purpose, revert the change on the default branch.";

pub const DIVERGED_SUMMARY: &str = "This revision has diverged from the revision currently deployed for this root. \
The deployed revision was most likely force-applied from a branch.\n\n\
Deploying this revision may undo changes that are live. \
Unlock to continue deploying merged revisions; the plan will still require confirmation.";

pub const RERUN_NOT_IDENTICAL_SUMMARY: &str = "A rerun can only redeploy the revision that is currently deployed. \
This revision differs from the deployed one, so the rerun was refused.\n\n\
Trigger a regular deploy of this revision instead.";

pub const IDENTICAL_REVISION_SUMMARY: &str =
    "This revision is already deployed for this root. Nothing to do.";

/// Summary of a revision the deployer gave up on, with the full error chain.
pub fn process_error_summary(error: &(dyn std::error::Error + 'static)) -> String {
    let mut detail = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        detail.push_str(": ");
        detail.push_str(&cause.to_string());
        source = cause.source();
    }
    truncate_to(
        format!(
            "This revision could not be processed and was not recorded as deployed.\n\n```\n{}\n```",
            detail
        ),
        MAX_SUMMARY_LEN,
    )
}

/// Renders the summary for one workflow update.
pub fn render_workflow_summary(info: &DeploymentInfo, state: &WorkflowState) -> String {
    let mut out = String::new();
    let action = match state.mode {
        WorkflowMode::Deploy => "Deploy",
        WorkflowMode::PullRequest => "Plan",
    };
    out.push_str(&format!(
        "**{}** of `{}` at `{}` (triggered by {} via {})\n\n",
        action,
        info.root.name,
        info.commit.revision.short(),
        info.initiating_user,
        info.trigger()
    ));

    for (name, job) in [
        ("Plan", &state.plan),
        ("Validate", &state.validate),
        ("Apply", &state.apply),
    ] {
        if let Some(job) = job {
            out.push_str(&render_job(name, job));
        }
    }

    if state.is_complete() {
        out.push_str(&format!("\nResult: `{:?}`\n", state.result.reason));
    }

    truncate_to(out, MAX_SUMMARY_LEN)
}

fn render_job(name: &str, job: &Job) -> String {
    let status = match job.status {
        JobStatus::Waiting => ":hourglass: waiting for confirmation",
        JobStatus::InProgress => ":arrows_counterclockwise: in progress",
        JobStatus::Success => ":white_check_mark: succeeded",
        JobStatus::Failed => ":x: failed",
    };
    let mut out = format!("- **{}**: {}\n", name, status);

    if let Some(output) = &job.output
        && !output.is_empty()
    {
        let output = truncate_to(output.clone(), MAX_OUTPUT_LEN);
        out.push_str(&format!(
            "\n<details><summary>{} output</summary>\n\n```\n{}\n```\n</details>\n\n",
            name, output
        ));
    }
    out
}

/// Renders the summary of a revision waiting in the queue.
pub fn render_queued_summary(position: usize, lock: &LockState, is_merge: bool) -> String {
    let mut out = match position {
        0 => "Queued: next in line.".to_string(),
        n => format!("Queued: {} revision(s) ahead.", n),
    };
    if is_merge && let Some(banner) = render_lock_banner(lock) {
        out.push_str("\n\n");
        out.push_str(&banner);
    }
    out
}

/// A warning for merge-triggered revisions while the queue is locked.
pub fn render_lock_banner(lock: &LockState) -> Option<String> {
    if !lock.is_locked() {
        return None;
    }
    let revision = lock
        .revision
        .as_ref()
        .map(|r| format!(" at `{}`", r.short()))
        .unwrap_or_default();
    Some(format!(
        ":lock: Deploys of merged revisions are locked: this root was force-applied{}. \
         Unlock to deploy this revision.",
        revision
    ))
}

/// Truncates on a character boundary, marking the cut.
fn truncate_to(mut s: String, max: usize) -> String {
    const MARKER: &str = "\n... (truncated)";
    if s.len() <= max {
        return s;
    }
    let mut cut = max.saturating_sub(MARKER.len());
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s.push_str(MARKER);
    s
}
