//! Crate-wide error taxonomy.
//!
//! Every failure carries a machine kind tag, a human message, and a
//! structured context map. CLI collaborators render errors as
//! `error: <kind>: <message>`; `--json` mode uses [`Error::to_json`].

use std::collections::BTreeMap;

use thiserror::Error;

/// Structured key/value context attached to every error.
pub type ErrorContext = BTreeMap<String, String>;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for the orchestration core.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing configuration.
    #[error("config: {message}")]
    Config {
        message: String,
        context: ErrorContext,
    },
    /// Caller-supplied arguments violate a documented contract.
    #[error("validation: {message}")]
    Validation {
        message: String,
        context: ErrorContext,
    },
    /// Agent-lifecycle problem (spawn failed, pane missing, manifest invalid).
    #[error("agent: {message}")]
    Agent {
        message: String,
        context: ErrorContext,
    },
    /// Mail store or client failure; context carries the offending message id.
    #[error("mail: {message}")]
    Mail {
        message: String,
        context: ErrorContext,
    },
    /// Merge queue or resolver failure; context carries branch and tier.
    #[error("merge: {message}")]
    Merge {
        message: String,
        context: ErrorContext,
    },
    /// Checkpoint/resume or state-transition rule violation.
    #[error("lifecycle: {message}")]
    Lifecycle {
        message: String,
        context: ErrorContext,
    },
    /// Git or worktree operation failure; context carries branch and path.
    #[error("worktree: {message}")]
    Worktree {
        message: String,
        context: ErrorContext,
    },
    /// Low-level database failure (I/O, lock, corruption).
    #[error("store: {message}")]
    Store {
        message: String,
        context: ErrorContext,
    },
}

impl Error {
    /// Builds a [`Error::Config`] with context pairs.
    pub fn config(message: impl Into<String>, context: &[(&str, &str)]) -> Self {
        Self::Config {
            message: message.into(),
            context: to_context(context),
        }
    }

    /// Builds a [`Error::Validation`] with context pairs.
    pub fn validation(message: impl Into<String>, context: &[(&str, &str)]) -> Self {
        Self::Validation {
            message: message.into(),
            context: to_context(context),
        }
    }

    /// Builds a [`Error::Agent`] scoped to one agent name.
    pub fn agent(message: impl Into<String>, agent_name: &str) -> Self {
        Self::Agent {
            message: message.into(),
            context: to_context(&[("agent", agent_name)]),
        }
    }

    /// Builds a [`Error::Mail`] scoped to one message id.
    pub fn mail(message: impl Into<String>, message_id: &str) -> Self {
        Self::Mail {
            message: message.into(),
            context: to_context(&[("message_id", message_id)]),
        }
    }

    /// Builds a [`Error::Merge`] scoped to one branch and optional tier.
    pub fn merge(message: impl Into<String>, branch: &str, tier: Option<&str>) -> Self {
        let mut context = to_context(&[("branch", branch)]);
        if let Some(tier) = tier {
            context.insert("tier".to_string(), tier.to_string());
        }

        Self::Merge {
            message: message.into(),
            context,
        }
    }

    /// Builds a [`Error::Lifecycle`] with context pairs.
    pub fn lifecycle(message: impl Into<String>, context: &[(&str, &str)]) -> Self {
        Self::Lifecycle {
            message: message.into(),
            context: to_context(context),
        }
    }

    /// Builds a [`Error::Worktree`] scoped to one branch and path.
    pub fn worktree(message: impl Into<String>, branch: &str, path: &str) -> Self {
        Self::Worktree {
            message: message.into(),
            context: to_context(&[("branch", branch), ("path", path)]),
        }
    }

    /// Builds a [`Error::Store`] with context pairs.
    pub fn store(message: impl Into<String>, context: &[(&str, &str)]) -> Self {
        Self::Store {
            message: message.into(),
            context: to_context(context),
        }
    }

    /// Returns the machine kind tag for this error.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::Validation { .. } => "validation",
            Self::Agent { .. } => "agent",
            Self::Mail { .. } => "mail",
            Self::Merge { .. } => "merge",
            Self::Lifecycle { .. } => "lifecycle",
            Self::Worktree { .. } => "worktree",
            Self::Store { .. } => "store",
        }
    }

    /// Returns the human message without the kind prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Config { message, .. }
            | Self::Validation { message, .. }
            | Self::Agent { message, .. }
            | Self::Mail { message, .. }
            | Self::Merge { message, .. }
            | Self::Lifecycle { message, .. }
            | Self::Worktree { message, .. }
            | Self::Store { message, .. } => message,
        }
    }

    /// Returns the structured context map.
    pub fn context(&self) -> &ErrorContext {
        match self {
            Self::Config { context, .. }
            | Self::Validation { context, .. }
            | Self::Agent { context, .. }
            | Self::Mail { context, .. }
            | Self::Merge { context, .. }
            | Self::Lifecycle { context, .. }
            | Self::Worktree { context, .. }
            | Self::Store { context, .. } => context,
        }
    }

    /// Serializes the error for `--json` output.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "kind": self.kind(),
                "message": self.message(),
                "context": self.context(),
            }
        })
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Self::Store {
            message: format!("database operation failed: {err}"),
            context: ErrorContext::new(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Store {
            message: format!("I/O failure: {err}"),
            context: ErrorContext::new(),
        }
    }
}

fn to_context(pairs: &[(&str, &str)]) -> ErrorContext {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), (*value).to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_kind_prefix() {
        // Arrange
        let error = Error::merge("tier exhausted", "overstory/builder-1/task-abc", Some("reimagine"));

        // Act
        let rendered = error.to_string();

        // Assert
        assert_eq!(rendered, "merge: tier exhausted");
        assert_eq!(error.kind(), "merge");
    }

    #[test]
    fn test_merge_error_context_carries_branch_and_tier() {
        // Arrange
        let error = Error::merge("conflict", "feature/x", Some("auto-resolve"));

        // Act
        let context = error.context();

        // Assert
        assert_eq!(context.get("branch").map(String::as_str), Some("feature/x"));
        assert_eq!(context.get("tier").map(String::as_str), Some("auto-resolve"));
    }

    #[test]
    fn test_to_json_shape() {
        // Arrange
        let error = Error::mail("recipient not found", "msg-0123456789abcdef");

        // Act
        let json = error.to_json();

        // Assert
        assert_eq!(json["error"]["kind"], "mail");
        assert_eq!(json["error"]["message"], "recipient not found");
        assert_eq!(json["error"]["context"]["message_id"], "msg-0123456789abcdef");
    }

    #[test]
    fn test_sqlx_error_maps_to_store_kind() {
        // Arrange
        let source = sqlx::Error::PoolClosed;

        // Act
        let error = Error::from(source);

        // Assert
        assert_eq!(error.kind(), "store");
    }
}
