//! Per-agent manifests: crash-recovery checkpoints and persistent identity.
//!
//! A checkpoint is a small JSON snapshot an agent rewrites as it works so a
//! relaunch can resume mid-task. The identity manifest is the agent's CV
//! across sessions, stored as YAML next to the checkpoint.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::session::Capability;
use crate::error::{Error, Result};

/// Maximum retained entries in [`AgentIdentity::recent_tasks`].
pub const RECENT_TASKS_CAP: usize = 20;

/// Crash-recovery snapshot for one agent session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Agent the checkpoint belongs to.
    pub agent_name: String,
    /// Task being worked on.
    pub bead_id: String,
    /// Launcher session identifier.
    pub session_id: String,
    /// Free-form progress description.
    pub progress_summary: String,
    /// Files modified so far.
    pub files_modified: Vec<String>,
    /// Branch the work sits on.
    pub current_branch: String,
    /// What remains to be done.
    pub pending_work: String,
}

impl Checkpoint {
    /// Atomically writes the checkpoint: temp file in the same directory,
    /// then rename.
    ///
    /// Serialization is field-ordered and stable, so saving an unchanged
    /// checkpoint reproduces the file byte for byte.
    ///
    /// # Errors
    /// Returns [`Error::Lifecycle`] when the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let encoded = serde_json::to_string_pretty(self).map_err(|err| {
            Error::lifecycle(
                format!("failed to encode checkpoint: {err}"),
                &[("agent", &self.agent_name)],
            )
        })?;

        atomic_write(path, &encoded).map_err(|err| {
            Error::lifecycle(
                format!("failed to write checkpoint: {err}"),
                &[
                    ("agent", &self.agent_name),
                    ("path", &path.display().to_string()),
                ],
            )
        })
    }

    /// Loads a checkpoint.
    ///
    /// # Errors
    /// Returns [`Error::Lifecycle`] when the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::lifecycle(
                format!("failed to read checkpoint: {err}"),
                &[("path", &path.display().to_string())],
            )
        })?;

        serde_json::from_str(&raw).map_err(|err| {
            Error::lifecycle(
                format!("failed to parse checkpoint: {err}"),
                &[("path", &path.display().to_string())],
            )
        })
    }
}

/// One remembered task in an agent's identity manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task identifier.
    pub task_id: String,
    /// One-line outcome summary.
    pub summary: String,
    /// Unix seconds when the task finished.
    pub ts: i64,
}

/// Persistent per-agent CV carried across sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Agent name.
    pub name: String,
    /// Role the agent runs as.
    pub capability: Capability,
    /// Total sessions this agent has completed.
    pub sessions_completed: u64,
    /// Distinct expertise domains observed.
    pub expertise_domains: Vec<String>,
    /// Recent task history, oldest first, capped with FIFO eviction.
    pub recent_tasks: Vec<TaskRecord>,
}

impl AgentIdentity {
    /// Creates a fresh identity for a new agent.
    pub fn new(name: &str, capability: Capability) -> Self {
        Self {
            name: name.to_string(),
            capability,
            sessions_completed: 0,
            expertise_domains: Vec::new(),
            recent_tasks: Vec::new(),
        }
    }

    /// Records one completed task, evicting the oldest entry past the cap.
    pub fn record_task(&mut self, task_id: &str, summary: &str, ts: i64) {
        self.recent_tasks.push(TaskRecord {
            task_id: task_id.to_string(),
            summary: summary.to_string(),
            ts,
        });
        while self.recent_tasks.len() > RECENT_TASKS_CAP {
            self.recent_tasks.remove(0);
        }
        self.sessions_completed += 1;
    }

    /// Adds an expertise domain, keeping the list deduplicated.
    pub fn add_expertise(&mut self, domain: &str) {
        if !self.expertise_domains.iter().any(|known| known == domain) {
            self.expertise_domains.push(domain.to_string());
        }
    }

    /// Atomically writes the identity manifest as YAML.
    ///
    /// # Errors
    /// Returns [`Error::Lifecycle`] when the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<()> {
        let encoded = serde_yaml::to_string(self).map_err(|err| {
            Error::lifecycle(
                format!("failed to encode identity: {err}"),
                &[("agent", &self.name)],
            )
        })?;

        atomic_write(path, &encoded).map_err(|err| {
            Error::lifecycle(
                format!("failed to write identity: {err}"),
                &[("agent", &self.name), ("path", &path.display().to_string())],
            )
        })
    }

    /// Loads an identity manifest.
    ///
    /// # Errors
    /// Returns [`Error::Lifecycle`] when the file is missing or malformed.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::lifecycle(
                format!("failed to read identity: {err}"),
                &[("path", &path.display().to_string())],
            )
        })?;

        serde_yaml::from_str(&raw).map_err(|err| {
            Error::lifecycle(
                format!("failed to parse identity: {err}"),
                &[("path", &path.display().to_string())],
            )
        })
    }
}

/// Writes content to a temp file in the target's directory, then renames.
fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)?;

    Ok(())
}
