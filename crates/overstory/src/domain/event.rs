use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind tag for one stored event.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ToolStart,
    ToolEnd,
    SessionStart,
    SessionEnd,
    MailSent,
    MailReceived,
    Error,
    Custom,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::ToolStart => "tool_start",
            EventKind::ToolEnd => "tool_end",
            EventKind::SessionStart => "session_start",
            EventKind::SessionEnd => "session_end",
            EventKind::MailSent => "mail_sent",
            EventKind::MailReceived => "mail_received",
            EventKind::Error => "error",
            EventKind::Custom => "custom",
        };
        write!(f, "{name}")
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_start" => Ok(EventKind::ToolStart),
            "tool_end" => Ok(EventKind::ToolEnd),
            "session_start" => Ok(EventKind::SessionStart),
            "session_end" => Ok(EventKind::SessionEnd),
            "mail_sent" => Ok(EventKind::MailSent),
            "mail_received" => Ok(EventKind::MailReceived),
            "error" => Ok(EventKind::Error),
            "custom" => Ok(EventKind::Custom),
            _ => Err(format!("Unknown event kind: {s}")),
        }
    }
}

/// Severity level for one stored event.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for EventLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventLevel::Debug => "debug",
            EventLevel::Info => "info",
            EventLevel::Warn => "warn",
            EventLevel::Error => "error",
        };
        write!(f, "{name}")
    }
}

impl FromStr for EventLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(EventLevel::Debug),
            "info" => Ok(EventLevel::Info),
            "warn" => Ok(EventLevel::Warn),
            "error" => Ok(EventLevel::Error),
            _ => Err(format!("Unknown event level: {s}")),
        }
    }
}

/// One row in the insert-only event log.
///
/// `id` is assigned by the store on insert; `created_at` (Unix milliseconds)
/// is stamped on insert when zero. `tool_duration_ms` is back-filled by tool
/// correlation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Store-assigned row id; zero before insertion.
    pub id: i64,
    /// Run the event belongs to, when grouped.
    pub run_id: Option<String>,
    /// Agent that produced the event.
    pub agent_name: String,
    /// Launcher session identifier, when known.
    pub session_id: Option<String>,
    /// Event kind tag.
    pub kind: EventKind,
    /// Tool name for tool events.
    pub tool_name: Option<String>,
    /// Filtered tool arguments as a JSON string.
    pub tool_args: Option<String>,
    /// Milliseconds between a `tool_start` and its correlated `tool_end`.
    pub tool_duration_ms: Option<i64>,
    /// Severity level.
    pub level: EventLevel,
    /// Free-form JSON payload.
    pub payload: Option<String>,
    /// Unix milliseconds; stamped on insert when zero.
    pub created_at: i64,
}

impl StoredEvent {
    /// Creates an event with store-assigned id and timestamp.
    pub fn new(agent_name: &str, kind: EventKind) -> Self {
        Self {
            id: 0,
            run_id: None,
            agent_name: agent_name.to_string(),
            session_id: None,
            kind,
            tool_name: None,
            tool_args: None,
            tool_duration_ms: None,
            level: EventLevel::Info,
            payload: None,
            created_at: 0,
        }
    }

    /// Creates a tool event carrying the tool name.
    pub fn tool(agent_name: &str, kind: EventKind, tool_name: &str) -> Self {
        let mut event = Self::new(agent_name, kind);
        event.tool_name = Some(tool_name.to_string());

        event
    }
}

/// Aggregate per-tool statistics over correlated tool events.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolStat {
    /// Tool name.
    pub tool_name: String,
    /// Number of `tool_start` events observed.
    pub count: i64,
    /// Mean duration over rows with a back-filled duration.
    pub avg_duration_ms: f64,
    /// Maximum duration over rows with a back-filled duration.
    pub max_duration_ms: i64,
}

/// Upsert-replace summary for one completed agent session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionMetrics {
    /// Agent the summary belongs to.
    pub agent_name: String,
    /// Task the session worked on.
    pub bead_id: String,
    /// Wall-clock duration of the session in milliseconds.
    pub duration_ms: i64,
    /// Number of tool invocations.
    pub tool_calls: i64,
    /// Number of error events recorded.
    pub error_count: i64,
    /// Input tokens consumed.
    pub input_tokens: i64,
    /// Output tokens produced.
    pub output_tokens: i64,
    /// Whether the session reached `completed`.
    pub completed: bool,
    /// Unix milliseconds of the upsert.
    pub created_at: i64,
}

/// Periodic point-in-time token reading for one agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenSnapshot {
    /// Agent the snapshot belongs to.
    pub agent_name: String,
    /// Input tokens consumed so far.
    pub input_tokens: i64,
    /// Output tokens produced so far.
    pub output_tokens: i64,
    /// Unix milliseconds of the reading.
    pub created_at: i64,
}
