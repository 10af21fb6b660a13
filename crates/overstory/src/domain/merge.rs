use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Queue status for one branch integration.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    Pending,
    Merging,
    Merged,
    Conflict,
    Failed,
}

impl fmt::Display for MergeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeStatus::Pending => "pending",
            MergeStatus::Merging => "merging",
            MergeStatus::Merged => "merged",
            MergeStatus::Conflict => "conflict",
            MergeStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

impl FromStr for MergeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MergeStatus::Pending),
            "merging" => Ok(MergeStatus::Merging),
            "merged" => Ok(MergeStatus::Merged),
            "conflict" => Ok(MergeStatus::Conflict),
            "failed" => Ok(MergeStatus::Failed),
            _ => Err(format!("Unknown merge status: {s}")),
        }
    }
}

/// One level in the four-step conflict-resolution escalation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeTier {
    CleanMerge,
    AutoResolve,
    AiResolve,
    Reimagine,
}

impl MergeTier {
    /// Tiers in escalation order.
    pub const ALL: [MergeTier; 4] = [
        MergeTier::CleanMerge,
        MergeTier::AutoResolve,
        MergeTier::AiResolve,
        MergeTier::Reimagine,
    ];
}

impl fmt::Display for MergeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeTier::CleanMerge => "clean-merge",
            MergeTier::AutoResolve => "auto-resolve",
            MergeTier::AiResolve => "ai-resolve",
            MergeTier::Reimagine => "reimagine",
        };
        write!(f, "{name}")
    }
}

impl FromStr for MergeTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clean-merge" => Ok(MergeTier::CleanMerge),
            "auto-resolve" => Ok(MergeTier::AutoResolve),
            "ai-resolve" => Ok(MergeTier::AiResolve),
            "reimagine" => Ok(MergeTier::Reimagine),
            _ => Err(format!("Unknown merge tier: {s}")),
        }
    }
}

/// One queued branch integration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergeEntry {
    /// Branch awaiting integration; unique within the queue.
    pub branch_name: String,
    /// Task the branch implements.
    pub bead_id: String,
    /// Agent that produced the branch.
    pub agent_name: String,
    /// Paths the branch modified, as reported at enqueue time.
    pub files: Vec<String>,
    /// Current queue status.
    pub status: MergeStatus,
    /// Tier that produced the final outcome, once resolved.
    pub resolved_tier: Option<MergeTier>,
    /// Unix seconds when the entry was enqueued; stamped on insert when zero.
    pub enqueued_at: i64,
}

impl MergeEntry {
    /// Creates a pending entry with store-assigned enqueue time.
    pub fn new(branch_name: &str, bead_id: &str, agent_name: &str, files: Vec<String>) -> Self {
        Self {
            branch_name: branch_name.to_string(),
            bead_id: bead_id.to_string(),
            agent_name: agent_name.to_string(),
            files,
            status: MergeStatus::Pending,
            resolved_tier: None,
            enqueued_at: 0,
        }
    }
}

/// Final outcome of one resolver pass over a queue entry.
#[derive(Clone, Debug)]
pub struct MergeResult {
    /// The entry the resolver worked on.
    pub entry: MergeEntry,
    /// Whether the branch landed on the canonical branch.
    pub success: bool,
    /// Tier that succeeded, when any.
    pub tier: Option<MergeTier>,
    /// Conflicted paths observed during the attempt.
    pub conflict_files: Vec<String>,
    /// Failure detail when `success` is false.
    pub error_message: Option<String>,
}

/// A previously accepted conflict resolution, replayed as few-shot context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PastResolution {
    /// File the resolution applied to.
    pub file: String,
    /// Short description of the conflict pattern.
    pub summary: String,
    /// The resolved content that was accepted.
    pub resolution: String,
}

/// Prior conflict knowledge scoped to a file set.
///
/// `skip_tiers` lists tiers that repeatedly failed for this pattern and are
/// not attempted again.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConflictHistory {
    /// Tiers to skip entirely.
    pub skip_tiers: Vec<MergeTier>,
    /// Accepted resolutions fed to the AI tier.
    pub past_resolutions: Vec<PastResolution>,
    /// Files expected to conflict.
    pub predicted_conflict_files: Vec<String>,
}
