//! Pure health evaluation for the Zero-Failure-Crash watchdog.
//!
//! Signal priority when state is ambiguous: pane liveness beats recorded
//! state. The evaluator never touches I/O — the watchdog probes the
//! multiplexer and feeds the observation in.

use serde::{Deserialize, Serialize};

use super::session::{AgentSession, AgentState};

/// Health verdict for one session.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Stale,
    Zombie,
}

/// Action the watchdog should take for one session this tick.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestedAction {
    None,
    Nudge,
    Escalate,
    Terminate,
}

/// Result of evaluating one session against observed liveness.
#[derive(Clone, Debug)]
pub struct HealthCheck {
    /// Health verdict.
    pub status: HealthStatus,
    /// Human-readable reason for the verdict.
    pub reason: String,
    /// Action the escalation ladder should apply.
    pub suggested_action: SuggestedAction,
    /// Unix seconds when the evaluation ran.
    pub checked_at: i64,
}

/// Evaluates session health from recorded state and observed pane liveness.
///
/// Rules are applied in order, first match wins:
/// 1. Pane dead → zombie, terminate. Observable reality overrides the
///    recorded state.
/// 2. Completed → healthy.
/// 3. No activity past `stall_threshold_secs` at escalation 0 → stale, nudge.
/// 4. Still stale at escalation 1–2 → stale, escalate.
/// 5. Escalation ≥ 3 → zombie, terminate.
/// 6. Otherwise healthy.
pub fn evaluate_health(
    session: &AgentSession,
    is_alive: bool,
    now: i64,
    stall_threshold_secs: i64,
) -> HealthCheck {
    if !is_alive {
        return HealthCheck {
            status: HealthStatus::Zombie,
            reason: format!("pane {} is not alive", session.pane_name),
            suggested_action: SuggestedAction::Terminate,
            checked_at: now,
        };
    }

    if session.state == AgentState::Completed {
        return HealthCheck {
            status: HealthStatus::Healthy,
            reason: "session completed".to_string(),
            suggested_action: SuggestedAction::None,
            checked_at: now,
        };
    }

    let idle_secs = now.saturating_sub(session.last_activity);
    let is_stale = idle_secs > stall_threshold_secs;

    if is_stale && session.escalation_level == 0 {
        return HealthCheck {
            status: HealthStatus::Stale,
            reason: format!("no activity for {idle_secs}s"),
            suggested_action: SuggestedAction::Nudge,
            checked_at: now,
        };
    }

    if is_stale && (1..=2).contains(&session.escalation_level) {
        return HealthCheck {
            status: HealthStatus::Stale,
            reason: format!(
                "no activity for {idle_secs}s at escalation level {}",
                session.escalation_level
            ),
            suggested_action: SuggestedAction::Escalate,
            checked_at: now,
        };
    }

    if session.escalation_level >= 3 {
        return HealthCheck {
            status: HealthStatus::Zombie,
            reason: "escalation ladder exhausted".to_string(),
            suggested_action: SuggestedAction::Terminate,
            checked_at: now,
        };
    }

    HealthCheck {
        status: HealthStatus::Healthy,
        reason: format!("active {idle_secs}s ago"),
        suggested_action: SuggestedAction::None,
        checked_at: now,
    }
}
