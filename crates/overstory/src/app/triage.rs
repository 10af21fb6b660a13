//! Tier-1 AI triage for stalled sessions.
//!
//! At escalation level 2 the watchdog may hand the tail of a session log to
//! an external model and act on a single-token verdict. The failure default
//! is always `extend`: a broken triage path must never get an agent killed.

use std::path::Path;

use tracing::debug;

use crate::infra::ai::AiClient;

/// Number of log lines handed to the triage model.
pub const TRIAGE_LOG_LINES: usize = 50;

/// Single-token triage verdict.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TriageVerdict {
    /// Nudge again; do not advance the ladder this tick.
    Retry,
    /// Skip straight to termination.
    Terminate,
    /// Grant one free tick; do not advance, do not nudge.
    Extend,
}

impl TriageVerdict {
    fn parse(completion: &str) -> Option<Self> {
        let token = completion.split_whitespace().next()?;
        match token.to_ascii_lowercase().as_str() {
            "retry" => Some(Self::Retry),
            "terminate" => Some(Self::Terminate),
            "extend" => Some(Self::Extend),
            _ => None,
        }
    }
}

/// Runs triage over a session log tail and returns the verdict.
///
/// Any failure — missing log, subprocess failure, unparsable output —
/// resolves to [`TriageVerdict::Extend`].
pub async fn run_triage(ai: &dyn AiClient, agent_name: &str, log_path: &Path) -> TriageVerdict {
    let Some(tail) = read_log_tail(log_path, TRIAGE_LOG_LINES) else {
        debug!(agent = agent_name, "triage skipped: no session log");

        return TriageVerdict::Extend;
    };

    let prompt = format!(
        "An automated coding agent named {agent_name} has shown no activity past its \
         stall threshold. Below are the last lines of its session log.\n\
         Reply with exactly one word: retry (the agent should be prompted again), \
         terminate (the agent is wedged and should be killed), or extend (the agent \
         is still making progress and needs more time).\n\n{tail}"
    );

    match ai.complete(prompt).await {
        Ok(completion) => TriageVerdict::parse(&completion).unwrap_or_else(|| {
            debug!(agent = agent_name, "triage verdict unparsable, extending");

            TriageVerdict::Extend
        }),
        Err(err) => {
            debug!(agent = agent_name, "triage failed, extending: {err}");

            TriageVerdict::Extend
        }
    }
}

/// Reads the last `lines` lines of a log file, `None` when unreadable.
pub fn read_log_tail(path: &Path, lines: usize) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let all: Vec<&str> = raw.lines().collect();
    let start = all.len().saturating_sub(lines);

    Some(all[start..].join("\n"))
}
