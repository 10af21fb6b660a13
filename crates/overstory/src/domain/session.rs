use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role tag controlling spawn rights and tool policy for one agent.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Coordinator,
    Supervisor,
    Lead,
    Builder,
    Scout,
    Reviewer,
    Merger,
    Monitor,
}

impl Capability {
    /// Ordered list of all capabilities.
    pub const ALL: [Capability; 8] = [
        Capability::Coordinator,
        Capability::Supervisor,
        Capability::Lead,
        Capability::Builder,
        Capability::Scout,
        Capability::Reviewer,
        Capability::Merger,
        Capability::Monitor,
    ];

    /// Returns whether this capability outlives individual runs.
    ///
    /// Persistent agents are excluded from run-completion accounting but are
    /// still probed for liveness and escalated like any other session.
    pub fn is_persistent(self) -> bool {
        matches!(self, Capability::Coordinator | Capability::Monitor)
    }

    /// Returns the spawn/tool policy for this capability.
    pub fn policy(self) -> CapabilityPolicy {
        match self {
            Capability::Coordinator => CapabilityPolicy {
                spawnable: &[Capability::Supervisor, Capability::Lead, Capability::Monitor],
                tool_allowlist: &["Bash", "Read", "Glob", "Grep", "Task"],
                writes_code: false,
            },
            Capability::Supervisor => CapabilityPolicy {
                spawnable: &[Capability::Lead, Capability::Builder, Capability::Scout],
                tool_allowlist: &["Bash", "Read", "Glob", "Grep", "Task"],
                writes_code: false,
            },
            Capability::Lead => CapabilityPolicy {
                spawnable: &[
                    Capability::Builder,
                    Capability::Scout,
                    Capability::Reviewer,
                    Capability::Merger,
                ],
                tool_allowlist: &["Bash", "Read", "Write", "Edit", "Glob", "Grep", "Task"],
                writes_code: true,
            },
            Capability::Builder => CapabilityPolicy {
                spawnable: &[],
                tool_allowlist: &["Bash", "Read", "Write", "Edit", "Glob", "Grep"],
                writes_code: true,
            },
            Capability::Scout => CapabilityPolicy {
                spawnable: &[],
                tool_allowlist: &["Read", "Glob", "Grep", "WebFetch"],
                writes_code: false,
            },
            Capability::Reviewer => CapabilityPolicy {
                spawnable: &[],
                tool_allowlist: &["Read", "Glob", "Grep"],
                writes_code: false,
            },
            Capability::Merger => CapabilityPolicy {
                spawnable: &[],
                tool_allowlist: &["Bash", "Read", "Write", "Edit"],
                writes_code: true,
            },
            Capability::Monitor => CapabilityPolicy {
                spawnable: &[],
                tool_allowlist: &["Bash", "Read"],
                writes_code: false,
            },
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Coordinator => "coordinator",
            Capability::Supervisor => "supervisor",
            Capability::Lead => "lead",
            Capability::Builder => "builder",
            Capability::Scout => "scout",
            Capability::Reviewer => "reviewer",
            Capability::Merger => "merger",
            Capability::Monitor => "monitor",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordinator" => Ok(Capability::Coordinator),
            "supervisor" => Ok(Capability::Supervisor),
            "lead" => Ok(Capability::Lead),
            "builder" => Ok(Capability::Builder),
            "scout" => Ok(Capability::Scout),
            "reviewer" => Ok(Capability::Reviewer),
            "merger" => Ok(Capability::Merger),
            "monitor" => Ok(Capability::Monitor),
            _ => Err(format!("Unknown capability: {s}")),
        }
    }
}

/// Closed policy lookup attached to each capability.
#[derive(Clone, Copy, Debug)]
pub struct CapabilityPolicy {
    /// Capabilities this agent may spawn as children.
    pub spawnable: &'static [Capability],
    /// Tools this agent may invoke.
    pub tool_allowlist: &'static [&'static str],
    /// Whether the agent is expected to produce commits on its branch.
    pub writes_code: bool,
}

/// High-level lifecycle state for one agent session.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Booting,
    Working,
    Completed,
    Stalled,
    Zombie,
}

impl AgentState {
    /// Returns whether a transition to `next` is valid.
    ///
    /// Transitions are forward-only: `booting → working → {completed,
    /// stalled}`, `stalled → {working, zombie}`. Any active state may drop
    /// straight to `zombie` when observable liveness says the pane is gone.
    /// Terminal states accept no further transitions. Writing the current
    /// state again is always allowed so periodic reconciliation stays
    /// idempotent.
    pub fn can_transition_to(self, next: AgentState) -> bool {
        if self == next {
            return true;
        }

        matches!(
            (self, next),
            (AgentState::Booting, AgentState::Working)
                | (AgentState::Working, AgentState::Completed | AgentState::Stalled)
                | (AgentState::Stalled, AgentState::Working)
                | (
                    AgentState::Booting | AgentState::Working | AgentState::Stalled,
                    AgentState::Zombie
                )
        )
    }

    /// Returns whether this state accepts no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, AgentState::Completed | AgentState::Zombie)
    }

    /// Returns whether a session in this state counts as active.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            AgentState::Booting | AgentState::Working | AgentState::Stalled
        )
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentState::Booting => "booting",
            AgentState::Working => "working",
            AgentState::Completed => "completed",
            AgentState::Stalled => "stalled",
            AgentState::Zombie => "zombie",
        };
        write!(f, "{name}")
    }
}

impl FromStr for AgentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "booting" => Ok(AgentState::Booting),
            "working" => Ok(AgentState::Working),
            "completed" => Ok(AgentState::Completed),
            "stalled" => Ok(AgentState::Stalled),
            "zombie" => Ok(AgentState::Zombie),
            _ => Err(format!("Unknown agent state: {s}")),
        }
    }
}

/// Durable record of one spawned agent session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentSession {
    /// Unique, process-wide agent identity.
    pub agent_name: String,
    /// Role tag controlling spawn rights and tool policy.
    pub capability: Capability,
    /// Isolated git worktree the agent works in.
    pub worktree_path: PathBuf,
    /// Branch the agent commits to.
    pub branch_name: String,
    /// Opaque task identifier assigned to this session.
    pub bead_id: String,
    /// Multiplexer pane hosting the agent process.
    pub pane_name: String,
    /// Current lifecycle state.
    pub state: AgentState,
    /// OS process id of the agent, when known.
    pub pid: Option<i64>,
    /// Name of the agent that spawned this one, when any.
    pub parent_agent: Option<String>,
    /// Spawn-tree depth; zero only for persistent capabilities.
    pub depth: u32,
    /// Run this session belongs to, when grouped.
    pub run_id: Option<String>,
    /// Unix seconds when the session was created.
    pub started_at: i64,
    /// Unix seconds of the most recent observed activity.
    pub last_activity: i64,
    /// Unix seconds when the session entered `stalled`, cleared otherwise.
    pub stalled_since: Option<i64>,
    /// Monotonic 0..3 escalation counter while non-terminal.
    pub escalation_level: u8,
}

impl AgentSession {
    /// Validates structural invariants before persistence.
    ///
    /// # Errors
    /// Returns a message naming the violated rule when the depth/capability
    /// pairing or the stalled/`stalled_since` coherence is broken.
    pub fn validate(&self) -> Result<(), String> {
        if self.agent_name.is_empty() {
            return Err("agent_name must not be empty".to_string());
        }

        let persistent = self.capability.is_persistent();
        if persistent != (self.depth == 0) {
            return Err(format!(
                "depth {} is invalid for capability {}: depth 0 is reserved for \
                 coordinator and monitor",
                self.depth, self.capability
            ));
        }

        if (self.state == AgentState::Stalled) != self.stalled_since.is_some() {
            return Err(format!(
                "stalled_since must be set exactly when state is stalled (state: {})",
                self.state
            ));
        }

        Ok(())
    }
}

/// Lifecycle status for one run.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Active,
    Completed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Active => write!(f, "active"),
            RunStatus::Completed => write!(f, "completed"),
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(RunStatus::Active),
            "completed" => Ok(RunStatus::Completed),
            _ => Err(format!("Unknown run status: {s}")),
        }
    }
}

/// Grouping of related agent sessions under one coordinator activity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Run {
    /// Opaque run identifier.
    pub run_id: String,
    /// Coordinator agent that owns the run.
    pub coordinator: String,
    /// Current run status.
    pub status: RunStatus,
    /// Number of agents launched under this run.
    pub agent_count: i64,
    /// Unix seconds when the run was created.
    pub created_at: i64,
    /// Unix seconds when the run completed, when it has.
    pub completed_at: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder_session() -> AgentSession {
        AgentSession {
            agent_name: "builder-1".to_string(),
            capability: Capability::Builder,
            worktree_path: PathBuf::from("/tmp/worktrees/builder-1"),
            branch_name: "overstory/builder-1/task-abc".to_string(),
            bead_id: "task-abc".to_string(),
            pane_name: "overstory-builder-1".to_string(),
            state: AgentState::Working,
            pid: Some(4242),
            parent_agent: Some("lead-1".to_string()),
            depth: 2,
            run_id: None,
            started_at: 1_700_000_000,
            last_activity: 1_700_000_100,
            stalled_since: None,
            escalation_level: 0,
        }
    }

    #[test]
    fn test_state_transition_booting_to_working() {
        // Arrange
        let current_state = AgentState::Booting;

        // Act
        let can_transition = current_state.can_transition_to(AgentState::Working);

        // Assert
        assert!(can_transition);
    }

    #[test]
    fn test_state_transition_completed_is_terminal() {
        // Arrange
        let current_state = AgentState::Completed;

        // Act & Assert
        assert!(current_state.is_terminal());
        assert!(!current_state.can_transition_to(AgentState::Working));
        assert!(!current_state.can_transition_to(AgentState::Zombie));
    }

    #[test]
    fn test_state_transition_stalled_can_recover_or_die() {
        // Arrange
        let current_state = AgentState::Stalled;

        // Act & Assert
        assert!(current_state.can_transition_to(AgentState::Working));
        assert!(current_state.can_transition_to(AgentState::Zombie));
        assert!(!current_state.can_transition_to(AgentState::Completed));
    }

    #[test]
    fn test_state_transition_backward_is_rejected() {
        // Arrange
        let current_state = AgentState::Working;

        // Act
        let can_transition = current_state.can_transition_to(AgentState::Booting);

        // Assert
        assert!(!can_transition);
    }

    #[test]
    fn test_validate_rejects_zero_depth_builder() {
        // Arrange
        let mut session = builder_session();
        session.depth = 0;

        // Act
        let result = session.validate();

        // Assert
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_nonzero_depth_coordinator() {
        // Arrange
        let mut session = builder_session();
        session.capability = Capability::Coordinator;
        session.depth = 1;

        // Act
        let result = session.validate();

        // Assert
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_requires_stalled_since_coherence() {
        // Arrange
        let mut session = builder_session();
        session.state = AgentState::Stalled;
        session.stalled_since = None;

        // Act
        let result = session.validate();

        // Assert
        assert!(result.is_err());
    }

    #[test]
    fn test_capability_round_trip() {
        // Arrange & Act & Assert
        for capability in Capability::ALL {
            let parsed = capability
                .to_string()
                .parse::<Capability>()
                .expect("failed to parse capability");
            assert_eq!(parsed, capability);
        }
    }

    #[test]
    fn test_persistent_capabilities() {
        // Arrange & Act & Assert
        assert!(Capability::Coordinator.is_persistent());
        assert!(Capability::Monitor.is_persistent());
        assert!(!Capability::Builder.is_persistent());
    }

    #[test]
    fn test_scout_policy_cannot_spawn_or_write() {
        // Arrange
        let policy = Capability::Scout.policy();

        // Act & Assert
        assert!(policy.spawnable.is_empty());
        assert!(!policy.writes_code);
        assert!(!policy.tool_allowlist.contains(&"Write"));
    }
}
