//! Declarative project configuration and state-directory layout.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default state directory name under a project root.
pub const STATE_DIR_NAME: &str = ".overstory";

/// Config file name inside the state directory.
pub const CONFIG_FILE: &str = "config.yaml";

/// Validated project configuration.
///
/// Thresholds drive the watchdog and the subprocess drivers; the rules that
/// consume them are fixed. `load → dump → load` is identity on the validated
/// subset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OverstoryConfig {
    /// Branch merges integrate into.
    pub canonical_branch: String,
    /// Seconds of silence before a session counts as stalled.
    pub stall_threshold_secs: u64,
    /// Seconds of silence before a session is hard-killed regardless of
    /// ladder position.
    pub hard_kill_threshold_secs: u64,
    /// Watchdog tick interval in seconds.
    pub poll_interval_secs: u64,
    /// Seconds between SIGTERM and SIGKILL during tree kill.
    pub grace_period_secs: u64,
    /// Deadline for one git subprocess in seconds.
    pub git_timeout_secs: u64,
    /// Deadline for one AI resolver subprocess, per file, in seconds.
    pub ai_timeout_secs: u64,
    /// Deadline for one multiplexer subprocess in seconds.
    pub mux_timeout_secs: u64,
    /// Whether the level-2 ladder step consults AI triage.
    pub triage_enabled: bool,
    /// Command invoked for AI resolution and triage.
    pub ai_command: String,
    /// Minimum fraction of code-bearing lines an AI resolution must show.
    pub prose_code_line_ratio: f64,
}

impl Default for OverstoryConfig {
    fn default() -> Self {
        Self {
            canonical_branch: "main".to_string(),
            stall_threshold_secs: 600,
            hard_kill_threshold_secs: 1_800,
            poll_interval_secs: 30,
            grace_period_secs: 2,
            git_timeout_secs: 30,
            ai_timeout_secs: 120,
            mux_timeout_secs: 5,
            triage_enabled: false,
            ai_command: "claude".to_string(),
            prose_code_line_ratio: 0.5,
        }
    }
}

impl OverstoryConfig {
    /// Loads and validates configuration from a YAML file.
    ///
    /// # Errors
    /// Returns [`Error::Config`] when the file cannot be read, parsed, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::config(
                format!("failed to read config file: {err}"),
                &[("path", &path.display().to_string())],
            )
        })?;

        Self::from_yaml(&raw)
    }

    /// Parses and validates configuration from YAML text.
    ///
    /// # Errors
    /// Returns [`Error::Config`] on parse or validation failure.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|err| Error::config(format!("failed to parse config: {err}"), &[]))?;
        config.validate()?;

        Ok(config)
    }

    /// Serializes the configuration to YAML text.
    ///
    /// # Errors
    /// Returns [`Error::Config`] when serialization fails.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|err| Error::config(format!("failed to serialize config: {err}"), &[]))
    }

    /// Validates field-level constraints.
    ///
    /// # Errors
    /// Returns [`Error::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.canonical_branch.trim().is_empty() {
            return Err(Error::config(
                "canonical_branch must not be empty",
                &[("field", "canonical_branch")],
            ));
        }

        for (field, value) in [
            ("stall_threshold_secs", self.stall_threshold_secs),
            ("hard_kill_threshold_secs", self.hard_kill_threshold_secs),
            ("poll_interval_secs", self.poll_interval_secs),
            ("grace_period_secs", self.grace_period_secs),
            ("git_timeout_secs", self.git_timeout_secs),
            ("ai_timeout_secs", self.ai_timeout_secs),
            ("mux_timeout_secs", self.mux_timeout_secs),
        ] {
            if value == 0 {
                return Err(Error::config(
                    format!("{field} must be positive"),
                    &[("field", field)],
                ));
            }
        }

        if self.stall_threshold_secs >= self.hard_kill_threshold_secs {
            return Err(Error::config(
                "stall_threshold_secs must be below hard_kill_threshold_secs",
                &[("field", "stall_threshold_secs")],
            ));
        }

        if !(0.0..=1.0).contains(&self.prose_code_line_ratio) {
            return Err(Error::config(
                "prose_code_line_ratio must be within [0, 1]",
                &[("field", "prose_code_line_ratio")],
            ));
        }

        Ok(())
    }

    /// Stall threshold as a [`Duration`].
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_secs)
    }

    /// Watchdog poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// SIGTERM grace period as a [`Duration`].
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Resolved layout of one project's state directory.
///
/// All durable stores, specs, agent manifests, and logs live under this
/// directory. Path helpers do not touch the filesystem; [`StateDir::ensure`]
/// creates the directory tree.
#[derive(Clone, Debug)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    /// Wraps an explicit state directory root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves the conventional state directory under a project root.
    pub fn for_project(project_root: &Path) -> Self {
        Self::new(project_root.join(STATE_DIR_NAME))
    }

    /// Returns the state directory root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the declarative config file.
    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Path of the session + run store database.
    pub fn sessions_db(&self) -> PathBuf {
        self.root.join("sessions.db")
    }

    /// Path of the mail store database.
    pub fn mail_db(&self) -> PathBuf {
        self.root.join("mail.db")
    }

    /// Path of the event store database.
    pub fn events_db(&self) -> PathBuf {
        self.root.join("events.db")
    }

    /// Path of the merge queue database.
    pub fn merge_queue_db(&self) -> PathBuf {
        self.root.join("merge-queue.db")
    }

    /// Path of the legacy flat session file imported on first open.
    pub fn legacy_sessions_file(&self) -> PathBuf {
        self.root.join("agents.json")
    }

    /// Path of one task spec written by scouts and read by builders.
    pub fn spec_file(&self, bead_id: &str) -> PathBuf {
        self.root.join("specs").join(format!("{bead_id}.md"))
    }

    /// Per-agent manifest directory.
    pub fn agent_dir(&self, agent_name: &str) -> PathBuf {
        self.root.join("agents").join(agent_name)
    }

    /// Path of one agent's crash-recovery checkpoint.
    pub fn checkpoint_file(&self, agent_name: &str) -> PathBuf {
        self.agent_dir(agent_name).join("checkpoint.json")
    }

    /// Path of one agent's persistent identity manifest.
    pub fn identity_file(&self, agent_name: &str) -> PathBuf {
        self.agent_dir(agent_name).join("identity.yaml")
    }

    /// Per-agent, per-launch log directory.
    pub fn log_dir(&self, agent_name: &str, started_at: i64) -> PathBuf {
        self.root
            .join("logs")
            .join(agent_name)
            .join(started_at.to_string())
    }

    /// Path of one agent's most recent session log inside a log directory.
    pub fn session_log(&self, agent_name: &str, started_at: i64) -> PathBuf {
        self.log_dir(agent_name, started_at).join("session.log")
    }

    /// Creates the base directory tree.
    ///
    /// # Errors
    /// Returns [`Error::Store`] when a directory cannot be created.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.root.join("specs"),
            self.root.join("agents"),
            self.root.join("logs"),
        ] {
            std::fs::create_dir_all(&dir).map_err(|err| {
                Error::store(
                    format!("failed to create state directory: {err}"),
                    &[("path", &dir.display().to_string())],
                )
            })?;
        }

        Ok(())
    }
}
