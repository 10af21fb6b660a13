//! Process-tree termination for the watchdog.
//!
//! Descendants are discovered through `/proc/<pid>/task/*/children` and
//! signaled deepest-first so children never get reparented to init before
//! their own subtrees are handled. SIGTERM goes out first, survivors get
//! SIGKILL after the grace period, and the root pid is always signaled
//! last.

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::trace;

use crate::error::Result;

/// Counts of signals delivered during one tree kill.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeKillOutcome {
    /// Processes that received SIGTERM.
    pub terminated: usize,
    /// Survivors that needed SIGKILL after the grace period.
    pub forced: usize,
}

/// Recursively collects the descendant pids of `root`, depth-first.
///
/// The returned list is ordered parents-before-children and does not
/// include `root` itself. Processes that exit mid-walk are skipped.
pub fn descendant_pids(root: u32) -> Vec<u32> {
    let mut descendants = Vec::new();
    collect_children(root, &mut descendants);

    descendants
}

fn collect_children(pid: u32, out: &mut Vec<u32>) {
    for child in direct_children(pid) {
        out.push(child);
        collect_children(child, out);
    }
}

fn direct_children(pid: u32) -> Vec<u32> {
    let task_dir = PathBuf::from(format!("/proc/{pid}/task"));
    let Ok(tasks) = std::fs::read_dir(&task_dir) else {
        return Vec::new();
    };

    let mut children = Vec::new();
    for task in tasks.flatten() {
        let children_file = task.path().join("children");
        let Ok(raw) = std::fs::read_to_string(&children_file) else {
            continue;
        };
        for token in raw.split_whitespace() {
            if let Ok(child) = token.parse::<u32>() {
                children.push(child);
            }
        }
    }

    children
}

/// Returns whether a pid still exists.
pub fn is_process_alive(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Terminates a process tree: SIGTERM deepest-first, grace period, SIGKILL
/// survivors, root signaled last.
///
/// Signal delivery failures for individual pids are expected (the process
/// may have exited between discovery and delivery) and only traced.
///
/// # Errors
/// Currently infallible; the `Result` reserves room for platforms where
/// `/proc` discovery itself can fail.
pub async fn kill_tree(root: u32, grace_period: Duration) -> Result<TreeKillOutcome> {
    let mut ordered = descendant_pids(root);
    // Deepest first, root last.
    ordered.reverse();
    ordered.push(root);

    let mut outcome = TreeKillOutcome::default();
    for pid in &ordered {
        if send_signal(*pid, Signal::SIGTERM) {
            outcome.terminated += 1;
        }
    }

    tokio::time::sleep(grace_period).await;

    for pid in &ordered {
        if is_process_alive(*pid) && send_signal(*pid, Signal::SIGKILL) {
            outcome.forced += 1;
        }
    }

    Ok(outcome)
}

fn send_signal(pid: u32, signal: Signal) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };

    match kill(Pid::from_raw(pid), signal) {
        Ok(()) => true,
        Err(err) => {
            trace!(pid, %signal, "signal delivery skipped: {err}");

            false
        }
    }
}
