//! Git driver for the merge resolver.
//!
//! The resolver talks to git through the [`GitClient`] seam so tiers can be
//! exercised against a mock. The production implementation shells out to
//! `git` with an explicit deadline per invocation; deadline expiry surfaces
//! as a typed error and the resolver treats it as tier failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{Error, Result};
use crate::infra::BoxFuture;

/// Default deadline for one git subprocess.
pub const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Captured result of one driver subprocess.
#[derive(Clone, Debug, Default)]
pub struct CommandOutput {
    /// Process exit code; `-1` when the process died without one.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns whether the subprocess exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Extracts the best human-readable error detail from the output.
    pub fn detail(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }

        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }

        "Unknown git error".to_string()
    }
}

/// Async boundary between the resolver and the git repository.
#[cfg_attr(test, mockall::automock)]
pub trait GitClient: Send + Sync {
    /// Returns the working directory files are written into.
    fn workdir(&self) -> PathBuf;

    /// Merges `branch` into the checked-out canonical branch with
    /// no-edit/no-fast-forward policy.
    fn merge(&self, branch: String) -> BoxFuture<Result<CommandOutput>>;

    /// Returns the content of `rev:path`.
    fn show(&self, rev: String, path: String) -> BoxFuture<Result<CommandOutput>>;

    /// Lists paths currently in conflict.
    fn conflict_files(&self) -> BoxFuture<Result<Vec<String>>>;

    /// Aborts an in-progress merge.
    fn abort_merge(&self) -> BoxFuture<Result<CommandOutput>>;

    /// Stages one path.
    fn stage(&self, path: String) -> BoxFuture<Result<CommandOutput>>;

    /// Commits staged changes. With `parents`, a synthetic merge commit is
    /// created recording each parent rev.
    fn commit(&self, message: String, parents: Vec<String>) -> BoxFuture<Result<CommandOutput>>;
}

/// Production git driver shelling out to the `git` binary.
pub struct SystemGitClient {
    repo_path: PathBuf,
    timeout: Duration,
}

impl SystemGitClient {
    /// Creates a driver rooted at the repository checkout.
    pub fn new(repo_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            repo_path: repo_path.into(),
            timeout,
        }
    }

    async fn run(repo_path: PathBuf, timeout: Duration, args: Vec<String>) -> Result<CommandOutput> {
        run_with_deadline("git", &repo_path, timeout, args).await
    }
}

impl GitClient for SystemGitClient {
    fn workdir(&self) -> PathBuf {
        self.repo_path.clone()
    }

    fn merge(&self, branch: String) -> BoxFuture<Result<CommandOutput>> {
        let repo_path = self.repo_path.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            Self::run(
                repo_path,
                timeout,
                vec![
                    "merge".to_string(),
                    "--no-edit".to_string(),
                    "--no-ff".to_string(),
                    branch,
                ],
            )
            .await
        })
    }

    fn show(&self, rev: String, path: String) -> BoxFuture<Result<CommandOutput>> {
        let repo_path = self.repo_path.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            Self::run(
                repo_path,
                timeout,
                vec!["show".to_string(), format!("{rev}:{path}")],
            )
            .await
        })
    }

    fn conflict_files(&self) -> BoxFuture<Result<Vec<String>>> {
        let repo_path = self.repo_path.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let output = Self::run(
                repo_path,
                timeout,
                vec![
                    "diff".to_string(),
                    "--name-only".to_string(),
                    "--diff-filter=U".to_string(),
                ],
            )
            .await?;

            if !output.success() {
                return Err(Error::worktree(
                    format!("failed to list conflicted files: {}", output.detail()),
                    "",
                    "",
                ));
            }

            Ok(parse_path_list(&output.stdout))
        })
    }

    fn abort_merge(&self) -> BoxFuture<Result<CommandOutput>> {
        let repo_path = self.repo_path.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            Self::run(
                repo_path,
                timeout,
                vec!["merge".to_string(), "--abort".to_string()],
            )
            .await
        })
    }

    fn stage(&self, path: String) -> BoxFuture<Result<CommandOutput>> {
        let repo_path = self.repo_path.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            Self::run(repo_path, timeout, vec!["add".to_string(), path]).await
        })
    }

    fn commit(&self, message: String, parents: Vec<String>) -> BoxFuture<Result<CommandOutput>> {
        let repo_path = self.repo_path.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            if parents.is_empty() {
                // Hooks already ran in the agent worktree.
                return Self::run(
                    repo_path,
                    timeout,
                    vec![
                        "commit".to_string(),
                        "--no-verify".to_string(),
                        "-m".to_string(),
                        message,
                    ],
                )
                .await;
            }

            // Synthetic merge commit: stage everything, then record the
            // requested parents explicitly via commit-tree.
            let staged = Self::run(
                repo_path.clone(),
                timeout,
                vec!["add".to_string(), "-A".to_string()],
            )
            .await?;
            if !staged.success() {
                return Ok(staged);
            }

            let tree = Self::run(repo_path.clone(), timeout, vec!["write-tree".to_string()]).await?;
            if !tree.success() {
                return Ok(tree);
            }
            let tree_id = tree.stdout.trim().to_string();

            let mut commit_args = vec!["commit-tree".to_string(), tree_id];
            for parent in &parents {
                commit_args.push("-p".to_string());
                commit_args.push(parent.clone());
            }
            commit_args.push("-m".to_string());
            commit_args.push(message);
            let commit = Self::run(repo_path.clone(), timeout, commit_args).await?;
            if !commit.success() {
                return Ok(commit);
            }
            let commit_id = commit.stdout.trim().to_string();

            Self::run(
                repo_path,
                timeout,
                vec!["update-ref".to_string(), "HEAD".to_string(), commit_id],
            )
            .await
        })
    }
}

/// Runs one driver subprocess with an explicit deadline.
pub(crate) async fn run_with_deadline(
    program: &str,
    cwd: &Path,
    timeout: Duration,
    args: Vec<String>,
) -> Result<CommandOutput> {
    let output = tokio::time::timeout(
        timeout,
        Command::new(program)
            .args(&args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output(),
    )
    .await
    .map_err(|_| {
        Error::worktree(
            format!("{program} timed out after {}s", timeout.as_secs()),
            "",
            &cwd.display().to_string(),
        )
    })?
    .map_err(|err| {
        Error::worktree(
            format!("failed to execute {program}: {err}"),
            "",
            &cwd.display().to_string(),
        )
    })?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

fn parse_path_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .collect()
}
