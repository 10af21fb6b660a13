//! Zero-Failure-Crash watchdog.
//!
//! A single polling loop that reconciles recorded session state with
//! observable reality and applies the progressive escalation ladder. Signal
//! priority when the two disagree: pane liveness, then process liveness,
//! then the database row. Every recording path in here is fire-and-forget —
//! monitoring must never crash the monitor.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::app::record::RecordSink;
use crate::app::triage::{TriageVerdict, run_triage};
use crate::config::{OverstoryConfig, StateDir};
use crate::domain::event::{EventKind, EventLevel, StoredEvent};
use crate::domain::health::{SuggestedAction, evaluate_health};
use crate::domain::session::{AgentSession, AgentState};
use crate::error::Result;
use crate::infra::ai::AiClient;
use crate::infra::db::sessions::SessionStore;
use crate::infra::db::unix_timestamp_now;
use crate::infra::mux::MuxClient;
use crate::infra::proc::{is_process_alive, kill_tree};

/// Escalation level at which the ladder terminates a session.
const TERMINATE_LEVEL: u8 = 3;

/// The ZFC monitor daemon.
pub struct Watchdog {
    sessions: SessionStore,
    sink: RecordSink,
    mux: Arc<dyn MuxClient>,
    triage_ai: Option<Arc<dyn AiClient>>,
    state_dir: StateDir,
    config: OverstoryConfig,
}

impl Watchdog {
    /// Creates a watchdog over the session store and drivers.
    ///
    /// Passing `triage_ai` enables the level-2 AI triage step; without it
    /// the ladder advances mechanically.
    pub fn new(
        sessions: SessionStore,
        sink: RecordSink,
        mux: Arc<dyn MuxClient>,
        triage_ai: Option<Arc<dyn AiClient>>,
        state_dir: StateDir,
        config: OverstoryConfig,
    ) -> Self {
        Self {
            sessions,
            sink,
            mux,
            triage_ai,
            state_dir,
            config,
        }
    }

    /// Runs the polling loop until the token is cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        // Only the session enumeration itself can surface
                        // here; individual sessions never fail the tick.
                        warn!("watchdog tick skipped: {err}");
                    }
                }
            }
        }
    }

    /// Runs one poll pass over every active session.
    ///
    /// # Errors
    /// Returns an error only when active sessions cannot be enumerated.
    pub async fn tick(&self) -> Result<()> {
        let active = self.sessions.get_active().await?;
        for session in active {
            if let Err(err) = self.check_session(&session).await {
                debug!(agent = %session.agent_name, "session check failed: {err}");
            }
        }

        Ok(())
    }

    /// Returns whether a run's non-persistent sessions have all reached a
    /// terminal state.
    ///
    /// Persistent capabilities (coordinator, monitor) are excluded from
    /// completion accounting; they are still health-checked like everyone
    /// else.
    ///
    /// # Errors
    /// Returns an error if run sessions cannot be read.
    pub async fn is_run_complete(&self, run_id: &str) -> Result<bool> {
        let sessions = self.sessions.get_by_run(run_id).await?;

        Ok(sessions
            .iter()
            .filter(|session| !session.capability.is_persistent())
            .all(|session| session.state.is_terminal()))
    }

    /// Evaluates one session and applies the escalation ladder.
    async fn check_session(&self, session: &AgentSession) -> Result<()> {
        let is_alive = self.probe_liveness(session).await;
        let now = unix_timestamp_now();
        let stall_threshold =
            i64::try_from(self.config.stall_threshold_secs).unwrap_or(i64::MAX);
        let health = evaluate_health(session, is_alive, now, stall_threshold);

        // A hard-kill overdue session bypasses the ladder entirely.
        let idle_secs = now.saturating_sub(session.last_activity);
        let hard_kill =
            idle_secs > i64::try_from(self.config.hard_kill_threshold_secs).unwrap_or(i64::MAX);
        if hard_kill && !session.state.is_terminal() {
            warn!(agent = %session.agent_name, idle_secs, "hard-kill threshold exceeded");

            return self.terminate(session).await;
        }

        match health.suggested_action {
            SuggestedAction::None => self.reconcile_recovery(session).await,
            SuggestedAction::Nudge => self.apply_first_stall(session, now).await,
            SuggestedAction::Escalate => self.apply_escalation(session, now).await,
            SuggestedAction::Terminate => self.terminate(session).await,
        }
    }

    /// Probes observable liveness with ZFC priority: pane, then pid, then
    /// the recorded row (assumed alive when nothing observable disagrees).
    async fn probe_liveness(&self, session: &AgentSession) -> bool {
        match self.mux.is_pane_alive(session.pane_name.clone()).await {
            Ok(alive) => alive,
            Err(err) => {
                trace!(agent = %session.agent_name, "pane probe failed: {err}");

                match session.pid {
                    Some(pid) => u32::try_from(pid).is_ok_and(is_process_alive),
                    None => true,
                }
            }
        }
    }

    /// Transitions a stalled session back to working once activity resumed.
    async fn reconcile_recovery(&self, session: &AgentSession) -> Result<()> {
        if session.state == AgentState::Stalled {
            debug!(agent = %session.agent_name, "stalled session active again");
            self.sessions
                .update_state(&session.agent_name, AgentState::Working)
                .await?;
        }

        Ok(())
    }

    /// Ladder level 0: warn, mark stalled, arm the ladder, first nudge.
    async fn apply_first_stall(&self, session: &AgentSession, now: i64) -> Result<()> {
        warn!(
            agent = %session.agent_name,
            idle_secs = now.saturating_sub(session.last_activity),
            "session stalled"
        );

        if session.state != AgentState::Stalled {
            if let Err(err) = self
                .sessions
                .update_state(&session.agent_name, AgentState::Stalled)
                .await
            {
                trace!(agent = %session.agent_name, "stall transition rejected: {err}");
            }
        }
        self.sessions
            .update_escalation(&session.agent_name, 1, Some(now))
            .await?;
        self.nudge(session).await;

        Ok(())
    }

    /// Ladder levels 1 and 2.
    async fn apply_escalation(&self, session: &AgentSession, now: i64) -> Result<()> {
        match session.escalation_level {
            1 => {
                self.nudge(session).await;
                self.sessions
                    .update_escalation(&session.agent_name, 2, session.stalled_since.or(Some(now)))
                    .await?;
            }
            _ => {
                if self.config.triage_enabled {
                    if let Some(ai) = &self.triage_ai {
                        return self.apply_triage(session, Arc::clone(ai), now).await;
                    }
                }
                self.sessions
                    .update_escalation(
                        &session.agent_name,
                        TERMINATE_LEVEL,
                        session.stalled_since.or(Some(now)),
                    )
                    .await?;
            }
        }

        Ok(())
    }

    /// Ladder level 2 with triage enabled: act on the model's verdict.
    async fn apply_triage(
        &self,
        session: &AgentSession,
        ai: Arc<dyn AiClient>,
        now: i64,
    ) -> Result<()> {
        let log_path = self
            .state_dir
            .session_log(&session.agent_name, session.started_at);
        let verdict = run_triage(ai.as_ref(), &session.agent_name, &log_path).await;
        debug!(agent = %session.agent_name, ?verdict, "triage verdict");

        match verdict {
            // Re-nudge without advancing the ladder this tick.
            TriageVerdict::Retry => self.nudge(session).await,
            // Skip straight to the terminal rung.
            TriageVerdict::Terminate => {
                self.sessions
                    .update_escalation(
                        &session.agent_name,
                        TERMINATE_LEVEL,
                        session.stalled_since.or(Some(now)),
                    )
                    .await?;

                return self.terminate(session).await;
            }
            // One free tick: no advance, no nudge.
            TriageVerdict::Extend => {}
        }

        Ok(())
    }

    /// Ladder level 3: kill the process tree, close the pane, record the
    /// terminal state.
    async fn terminate(&self, session: &AgentSession) -> Result<()> {
        warn!(agent = %session.agent_name, "terminating session");

        if let Some(pid) = session.pid {
            if let Ok(pid) = u32::try_from(pid) {
                match kill_tree(pid, self.config.grace_period()).await {
                    Ok(outcome) => trace!(
                        agent = %session.agent_name,
                        terminated = outcome.terminated,
                        forced = outcome.forced,
                        "process tree signaled"
                    ),
                    Err(err) => trace!(agent = %session.agent_name, "tree kill failed: {err}"),
                }
            }
        }

        if let Err(err) = self.mux.kill_pane(session.pane_name.clone()).await {
            trace!(agent = %session.agent_name, "pane kill failed: {err}");
        }

        // The row stays behind in its terminal state for observers.
        self.sessions
            .update_state(&session.agent_name, AgentState::Zombie)
            .await?;

        let mut event = StoredEvent::new(&session.agent_name, EventKind::Error);
        event.level = EventLevel::Error;
        event.payload = Some(
            serde_json::json!({
                "watchdog": "terminated",
                "pane": session.pane_name,
                "escalation_level": session.escalation_level,
            })
            .to_string(),
        );
        self.sink.emit(event);

        Ok(())
    }

    /// Types a wake-up prompt into the session's pane, best-effort.
    async fn nudge(&self, session: &AgentSession) {
        let text = format!(
            "You appear stalled on task {}. Reply with a status update or continue working.",
            session.bead_id
        );
        match self.mux.send_keys(session.pane_name.clone(), text).await {
            Ok(()) => {
                let mut event = StoredEvent::new(&session.agent_name, EventKind::MailSent);
                event.payload = Some(
                    serde_json::json!({ "watchdog": "nudge", "pane": session.pane_name })
                        .to_string(),
                );
                self.sink.emit(event);
            }
            Err(err) => trace!(agent = %session.agent_name, "nudge failed: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::tempdir;

    use super::*;
    use crate::domain::session::Capability;
    use crate::infra::db::events::EventStore;
    use crate::infra::mux::MockMuxClient;

    fn config() -> OverstoryConfig {
        OverstoryConfig::default()
    }

    async fn watchdog_with(mux: MockMuxClient, config: OverstoryConfig) -> (Watchdog, SessionStore, EventStore) {
        let sessions = SessionStore::open_in_memory()
            .await
            .expect("failed to open session store");
        let events = EventStore::open_in_memory()
            .await
            .expect("failed to open event store");
        let sink = RecordSink::new(events.clone(), 64);
        let state_dir = StateDir::new(tempdir().expect("failed to create temp dir").keep());
        let watchdog = Watchdog::new(
            sessions.clone(),
            sink,
            Arc::new(mux),
            None,
            state_dir,
            config,
        );

        (watchdog, sessions, events)
    }

    fn session(name: &str, state: AgentState, idle_secs: i64, level: u8) -> AgentSession {
        let now = unix_timestamp_now();

        AgentSession {
            agent_name: name.to_string(),
            capability: Capability::Builder,
            worktree_path: PathBuf::from(format!("/tmp/worktrees/{name}")),
            branch_name: format!("overstory/{name}/task-abc"),
            bead_id: "task-abc".to_string(),
            pane_name: format!("overstory-{name}"),
            state,
            pid: None,
            parent_agent: Some("lead-1".to_string()),
            depth: 2,
            run_id: None,
            started_at: now - idle_secs - 60,
            last_activity: now - idle_secs,
            stalled_since: (state == AgentState::Stalled).then(|| now - idle_secs),
            escalation_level: level,
        }
    }

    fn alive_mux() -> MockMuxClient {
        let mut mux = MockMuxClient::new();
        mux.expect_is_pane_alive()
            .returning(|_| Box::pin(async { Ok(true) }));

        mux
    }

    #[tokio::test]
    async fn test_first_stall_tick_stalls_arms_and_nudges() {
        // Arrange — 12 minutes idle at level 0
        let mut mux = alive_mux();
        mux.expect_send_keys()
            .times(1)
            .returning(|_, _| Box::pin(async { Ok(()) }));
        let (watchdog, sessions, _) = watchdog_with(mux, config()).await;
        sessions
            .upsert(&session("builder-1", AgentState::Working, 720, 0))
            .await
            .expect("failed to upsert");

        // Act
        watchdog.tick().await.expect("tick failed");

        // Assert
        let updated = sessions
            .get_by_name("builder-1")
            .await
            .expect("failed to load")
            .expect("expected session");
        assert_eq!(updated.state, AgentState::Stalled);
        assert_eq!(updated.escalation_level, 1);
        assert!(updated.stalled_since.is_some());
    }

    #[tokio::test]
    async fn test_ladder_reaches_termination_after_three_more_ticks() {
        // Arrange — scenario: one stall tick already happened
        let mut mux = alive_mux();
        mux.expect_send_keys()
            .returning(|_, _| Box::pin(async { Ok(()) }));
        mux.expect_kill_pane()
            .times(1)
            .returning(|_| Box::pin(async { Ok(()) }));
        let (watchdog, sessions, _) = watchdog_with(mux, config()).await;
        sessions
            .upsert(&session("builder-1", AgentState::Stalled, 720, 1))
            .await
            .expect("failed to upsert");

        // Act — tick: 1→2 (nudge), tick: 2→3 (triage disabled), tick: terminate
        watchdog.tick().await.expect("tick failed");
        watchdog.tick().await.expect("tick failed");
        watchdog.tick().await.expect("tick failed");

        // Assert
        let updated = sessions
            .get_by_name("builder-1")
            .await
            .expect("failed to load")
            .expect("expected session");
        assert_eq!(updated.state, AgentState::Zombie);
        // Terminal transition resets the ladder.
        assert_eq!(updated.escalation_level, 0);
    }

    #[tokio::test]
    async fn test_zfc_dead_pane_overrides_recorded_state() {
        // Arrange — the row says working with fresh activity
        let mut mux = MockMuxClient::new();
        mux.expect_is_pane_alive()
            .returning(|_| Box::pin(async { Ok(false) }));
        mux.expect_kill_pane()
            .times(1)
            .returning(|_| Box::pin(async { Ok(()) }));
        let (watchdog, sessions, events) = watchdog_with(mux, config()).await;
        sessions
            .upsert(&session("builder-1", AgentState::Working, 5, 0))
            .await
            .expect("failed to upsert");

        // Act
        watchdog.tick().await.expect("tick failed");

        // Assert — zombie regardless of last_activity, row retained
        let updated = sessions
            .get_by_name("builder-1")
            .await
            .expect("failed to load")
            .expect("expected session");
        assert_eq!(updated.state, AgentState::Zombie);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        let recorded = events
            .by_agent("builder-1", 10)
            .await
            .expect("failed to load events");
        assert!(!recorded.is_empty());
    }

    #[tokio::test]
    async fn test_healthy_sessions_are_untouched() {
        // Arrange
        let (watchdog, sessions, _) = watchdog_with(alive_mux(), config()).await;
        sessions
            .upsert(&session("builder-1", AgentState::Working, 30, 0))
            .await
            .expect("failed to upsert");

        // Act
        watchdog.tick().await.expect("tick failed");

        // Assert
        let updated = sessions
            .get_by_name("builder-1")
            .await
            .expect("failed to load")
            .expect("expected session");
        assert_eq!(updated.state, AgentState::Working);
        assert_eq!(updated.escalation_level, 0);
    }

    #[tokio::test]
    async fn test_stalled_session_with_fresh_activity_recovers() {
        // Arrange — marked stalled but activity resumed
        let (watchdog, sessions, _) = watchdog_with(alive_mux(), config()).await;
        sessions
            .upsert(&session("builder-1", AgentState::Stalled, 10, 1))
            .await
            .expect("failed to upsert");

        // Act
        watchdog.tick().await.expect("tick failed");

        // Assert
        let updated = sessions
            .get_by_name("builder-1")
            .await
            .expect("failed to load")
            .expect("expected session");
        assert_eq!(updated.state, AgentState::Working);
    }

    #[tokio::test]
    async fn test_run_completion_ignores_persistent_capabilities() {
        // Arrange — a completed builder and a long-lived coordinator
        let (watchdog, sessions, _) = watchdog_with(MockMuxClient::new(), config()).await;
        let run = sessions
            .create_run("coordinator-1")
            .await
            .expect("failed to create run");
        let mut builder = session("builder-1", AgentState::Completed, 0, 0);
        builder.run_id = Some(run.run_id.clone());
        sessions.upsert(&builder).await.expect("failed to upsert");
        let mut coordinator = session("coordinator-1", AgentState::Working, 0, 0);
        coordinator.capability = Capability::Coordinator;
        coordinator.depth = 0;
        coordinator.run_id = Some(run.run_id.clone());
        sessions
            .upsert(&coordinator)
            .await
            .expect("failed to upsert coordinator");

        // Act
        let complete = watchdog
            .is_run_complete(&run.run_id)
            .await
            .expect("failed to check run");

        // Assert — the working coordinator does not block completion
        assert!(complete);
    }

    #[tokio::test]
    async fn test_hard_kill_threshold_bypasses_ladder() {
        // Arrange — 40 minutes idle at level 0
        let mut mux = alive_mux();
        mux.expect_kill_pane()
            .times(1)
            .returning(|_| Box::pin(async { Ok(()) }));
        let (watchdog, sessions, _) = watchdog_with(mux, config()).await;
        sessions
            .upsert(&session("builder-1", AgentState::Working, 2_400, 0))
            .await
            .expect("failed to upsert");

        // Act
        watchdog.tick().await.expect("tick failed");

        // Assert
        let updated = sessions
            .get_by_name("builder-1")
            .await
            .expect("failed to load")
            .expect("expected session");
        assert_eq!(updated.state, AgentState::Zombie);
    }
}
