//! Terminal multiplexer driver.
//!
//! The watchdog is multiplexer-agnostic: it only talks to [`MuxClient`].
//! The production implementation maps each logical pane to a detached tmux
//! session, which keeps pane names process-wide unique and survives the
//! front end detaching.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::infra::BoxFuture;
use crate::infra::git::{CommandOutput, run_with_deadline};

/// Default deadline for one multiplexer subprocess.
pub const DEFAULT_MUX_TIMEOUT: Duration = Duration::from_secs(5);

/// Async boundary between the watchdog/launcher and the multiplexer.
#[cfg_attr(test, mockall::automock)]
pub trait MuxClient: Send + Sync {
    /// Creates a detached pane running `command` in `cwd` with extra
    /// environment variables.
    fn create_pane(
        &self,
        name: String,
        cwd: PathBuf,
        command: String,
        env: Vec<(String, String)>,
    ) -> BoxFuture<Result<()>>;

    /// Kills one pane; killing a pane that is already gone is not an error.
    fn kill_pane(&self, name: String) -> BoxFuture<Result<()>>;

    /// Probes whether a pane is alive.
    fn is_pane_alive(&self, name: String) -> BoxFuture<Result<bool>>;

    /// Types text into a pane followed by Enter.
    fn send_keys(&self, name: String, text: String) -> BoxFuture<Result<()>>;

    /// Captures the last `lines` of pane output (full scrollback when
    /// `None`).
    fn capture(&self, name: String, lines: Option<u32>) -> BoxFuture<Result<String>>;

    /// Lists every live pane name.
    fn list_panes(&self) -> BoxFuture<Result<Vec<String>>>;
}

/// Production driver shelling out to `tmux`.
pub struct TmuxClient {
    timeout: Duration,
}

impl TmuxClient {
    /// Creates a driver with the given per-command deadline.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run(timeout: Duration, args: Vec<String>) -> Result<CommandOutput> {
        let cwd = std::env::temp_dir();

        run_with_deadline("tmux", &cwd, timeout, args).await
    }
}

impl MuxClient for TmuxClient {
    fn create_pane(
        &self,
        name: String,
        cwd: PathBuf,
        command: String,
        env: Vec<(String, String)>,
    ) -> BoxFuture<Result<()>> {
        let timeout = self.timeout;

        Box::pin(async move {
            let mut args = vec![
                "new-session".to_string(),
                "-d".to_string(),
                "-s".to_string(),
                name.clone(),
                "-c".to_string(),
                cwd.display().to_string(),
            ];
            for (key, value) in env {
                args.push("-e".to_string());
                args.push(format!("{key}={value}"));
            }
            args.push(command);

            let output = Self::run(timeout, args).await?;
            if !output.success() {
                return Err(Error::agent(
                    format!("failed to create pane: {}", output.detail()),
                    &name,
                ));
            }

            Ok(())
        })
    }

    fn kill_pane(&self, name: String) -> BoxFuture<Result<()>> {
        let timeout = self.timeout;

        Box::pin(async move {
            let output = Self::run(
                timeout,
                vec!["kill-session".to_string(), "-t".to_string(), name.clone()],
            )
            .await?;

            // A pane that is already gone counts as killed.
            if !output.success() && !output.stderr.contains("can't find session") {
                return Err(Error::agent(
                    format!("failed to kill pane: {}", output.detail()),
                    &name,
                ));
            }

            Ok(())
        })
    }

    fn is_pane_alive(&self, name: String) -> BoxFuture<Result<bool>> {
        let timeout = self.timeout;

        Box::pin(async move {
            let output = Self::run(
                timeout,
                vec!["has-session".to_string(), "-t".to_string(), name],
            )
            .await?;

            Ok(output.success())
        })
    }

    fn send_keys(&self, name: String, text: String) -> BoxFuture<Result<()>> {
        let timeout = self.timeout;

        Box::pin(async move {
            let output = Self::run(
                timeout,
                vec![
                    "send-keys".to_string(),
                    "-t".to_string(),
                    name.clone(),
                    text,
                    "Enter".to_string(),
                ],
            )
            .await?;

            if !output.success() {
                return Err(Error::agent(
                    format!("failed to send keys: {}", output.detail()),
                    &name,
                ));
            }

            Ok(())
        })
    }

    fn capture(&self, name: String, lines: Option<u32>) -> BoxFuture<Result<String>> {
        let timeout = self.timeout;

        Box::pin(async move {
            let mut args = vec![
                "capture-pane".to_string(),
                "-p".to_string(),
                "-t".to_string(),
                name.clone(),
            ];
            if let Some(lines) = lines {
                args.push("-S".to_string());
                args.push(format!("-{lines}"));
            }

            let output = Self::run(timeout, args).await?;
            if !output.success() {
                return Err(Error::agent(
                    format!("failed to capture pane: {}", output.detail()),
                    &name,
                ));
            }

            Ok(output.stdout)
        })
    }

    fn list_panes(&self) -> BoxFuture<Result<Vec<String>>> {
        let timeout = self.timeout;

        Box::pin(async move {
            let output = Self::run(
                timeout,
                vec![
                    "list-sessions".to_string(),
                    "-F".to_string(),
                    "#{session_name}".to_string(),
                ],
            )
            .await?;

            // No server running means no panes, not a failure.
            if !output.success() {
                return Ok(Vec::new());
            }

            Ok(output
                .stdout
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(ToString::to_string)
                .collect())
        })
    }
}
