//! AI subprocess driver shared by the merge resolver and watchdog triage.
//!
//! One prompt in on stdin, one completion out on stdout. Every invocation
//! carries an explicit deadline; the resolver treats expiry as tier failure
//! and triage falls back to its default verdict.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};
use crate::infra::BoxFuture;

/// Default per-file deadline for one AI invocation.
pub const DEFAULT_AI_TIMEOUT: Duration = Duration::from_secs(120);

/// Async boundary between orchestration and the external AI tool.
#[cfg_attr(test, mockall::automock)]
pub trait AiClient: Send + Sync {
    /// Sends one prompt and returns the raw completion text.
    fn complete(&self, prompt: String) -> BoxFuture<Result<String>>;
}

/// Production driver that pipes the prompt into a configured command.
pub struct SubprocessAiClient {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl SubprocessAiClient {
    /// Creates a driver invoking `command` with `args` per prompt.
    pub fn new(command: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            args,
            timeout,
        }
    }
}

impl AiClient for SubprocessAiClient {
    fn complete(&self, prompt: String) -> BoxFuture<Result<String>> {
        let command = self.command.clone();
        let args = self.args.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            let result = tokio::time::timeout(timeout, async {
                let mut child = Command::new(&command)
                    .args(&args)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    // Deadline expiry drops the future; the child must not
                    // outlive it.
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|err| {
                        Error::agent(format!("failed to spawn {command}: {err}"), &command)
                    })?;

                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(prompt.as_bytes()).await.map_err(|err| {
                        Error::agent(format!("failed to write prompt: {err}"), &command)
                    })?;
                    drop(stdin);
                }

                let output = child.wait_with_output().await.map_err(|err| {
                    Error::agent(format!("failed to read completion: {err}"), &command)
                })?;

                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);

                    return Err(Error::agent(
                        format!(
                            "{command} exited with {}: {}",
                            output.status.code().unwrap_or(-1),
                            stderr.trim()
                        ),
                        &command,
                    ));
                }

                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            })
            .await;

            match result {
                Ok(inner) => inner,
                Err(_) => Err(Error::agent(
                    format!("{command} timed out after {}s", timeout.as_secs()),
                    &command,
                )),
            }
        })
    }
}
