use std::fmt;
use std::str::FromStr;

use rand::Rng;
use rand::distr::Alphanumeric;
use serde::{Deserialize, Serialize};

/// Prefix for generated mail ids.
const MAIL_ID_PREFIX: &str = "msg-";

/// Number of random characters appended to [`MAIL_ID_PREFIX`].
const MAIL_ID_RANDOM_LEN: usize = 16;

/// Structured message category carried in the `type` column.
///
/// Protocol payloads in the `payload` column are typed by this tag.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailType {
    Status,
    Question,
    Result,
    Error,
    WorkerDone,
    MergeReady,
    Merged,
    MergeFailed,
    Escalation,
    HealthCheck,
    Dispatch,
    Assign,
}

impl fmt::Display for MailType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MailType::Status => "status",
            MailType::Question => "question",
            MailType::Result => "result",
            MailType::Error => "error",
            MailType::WorkerDone => "worker_done",
            MailType::MergeReady => "merge_ready",
            MailType::Merged => "merged",
            MailType::MergeFailed => "merge_failed",
            MailType::Escalation => "escalation",
            MailType::HealthCheck => "health_check",
            MailType::Dispatch => "dispatch",
            MailType::Assign => "assign",
        };
        write!(f, "{name}")
    }
}

impl FromStr for MailType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "status" => Ok(MailType::Status),
            "question" => Ok(MailType::Question),
            "result" => Ok(MailType::Result),
            "error" => Ok(MailType::Error),
            "worker_done" => Ok(MailType::WorkerDone),
            "merge_ready" => Ok(MailType::MergeReady),
            "merged" => Ok(MailType::Merged),
            "merge_failed" => Ok(MailType::MergeFailed),
            "escalation" => Ok(MailType::Escalation),
            "health_check" => Ok(MailType::HealthCheck),
            "dispatch" => Ok(MailType::Dispatch),
            "assign" => Ok(MailType::Assign),
            _ => Err(format!("Unknown mail type: {s}")),
        }
    }
}

/// Delivery priority for one message.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl fmt::Display for MailPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MailPriority::Low => "low",
            MailPriority::Normal => "normal",
            MailPriority::High => "high",
            MailPriority::Urgent => "urgent",
        };
        write!(f, "{name}")
    }
}

impl FromStr for MailPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(MailPriority::Low),
            "normal" => Ok(MailPriority::Normal),
            "high" => Ok(MailPriority::High),
            "urgent" => Ok(MailPriority::Urgent),
            _ => Err(format!("Unknown mail priority: {s}")),
        }
    }
}

/// One durable inter-agent message.
///
/// `to` always names a single recipient: group addresses are resolved into
/// one row per recipient before insertion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MailMessage {
    /// Message id; generated on insert when empty.
    pub id: String,
    /// Sender agent name.
    pub from: String,
    /// Single recipient agent name.
    pub to: String,
    /// Subject line.
    pub subject: String,
    /// Free-form body text.
    pub body: String,
    /// Message category.
    pub mail_type: MailType,
    /// Delivery priority.
    pub priority: MailPriority,
    /// Root-ward conversation link; null or the id of an existing message.
    pub thread_id: Option<String>,
    /// Optional JSON-encoded structured payload typed by `mail_type`.
    pub payload: Option<String>,
    /// Whether the recipient has consumed the message.
    pub read: bool,
    /// Unix milliseconds when the message was created; stamped on insert
    /// when zero.
    pub created_at: i64,
}

impl MailMessage {
    /// Creates an unsent message with store-assigned id and timestamp.
    pub fn new(from: &str, to: &str, subject: &str, body: &str) -> Self {
        Self {
            id: String::new(),
            from: from.to_string(),
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
            mail_type: MailType::Status,
            priority: MailPriority::Normal,
            thread_id: None,
            payload: None,
            read: false,
            created_at: 0,
        }
    }
}

/// Dynamic filter for [`get_all`](crate::infra::db::mail::MailStore::get_all).
#[derive(Clone, Debug, Default)]
pub struct MailFilter {
    /// Restrict to one sender.
    pub from: Option<String>,
    /// Restrict to one recipient.
    pub to: Option<String>,
    /// Only unread messages.
    pub unread_only: bool,
    /// Cap on returned rows.
    pub limit: Option<i64>,
}

/// Generates a new mail id: printable prefix plus 16 random characters.
///
/// Uses the thread-local CSPRNG so ids are unguessable across processes.
pub fn generate_mail_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(MAIL_ID_RANDOM_LEN)
        .map(char::from)
        .collect();

    format!("{MAIL_ID_PREFIX}{suffix}")
}
