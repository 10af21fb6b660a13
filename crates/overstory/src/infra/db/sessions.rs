//! Durable session and run store.
//!
//! Owns every [`AgentSession`] row plus the grouping of sessions into runs.
//! State transitions are forward-only and enforced inside a transaction that
//! re-reads the current row, so concurrent watchdog and front-end writers
//! cannot push a session backwards.

use std::path::Path;

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::domain::session::{AgentSession, AgentState, Run, RunStatus};
use crate::error::{Error, Result};
use crate::infra::db::{
    add_column_if_missing, checkpoint_and_close, open_pool, open_pool_in_memory,
    unix_timestamp_now,
};

const SESSION_COLUMNS: &str = "agent_name, capability, worktree_path, branch_name, bead_id, \
     pane_name, state, pid, parent_agent, depth, run_id, started_at, last_activity, \
     stalled_since, escalation_level";

/// Durable store for agent sessions and runs.
#[derive(Clone)]
pub struct SessionStore {
    pool: SqlitePool,
}

/// Result of opening the session store.
pub struct SessionStoreOpen {
    /// The opened store.
    pub store: SessionStore,
    /// Whether the legacy flat file was imported during this open.
    pub legacy_imported: bool,
}

impl SessionStore {
    /// Opens the store, applies idempotent migrations, and imports the
    /// legacy flat file once when the schema is fresh.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened, migrated, or the
    /// legacy file is present but unreadable.
    pub async fn open(db_path: &Path, legacy_file: Option<&Path>) -> Result<SessionStoreOpen> {
        let pool = open_pool(db_path).await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        let legacy_imported = store.import_legacy(legacy_file).await?;

        Ok(SessionStoreOpen {
            store,
            legacy_imported,
        })
    }

    /// Opens an in-memory store for tests.
    ///
    /// # Errors
    /// Returns an error if the database connection or schema setup fails.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = open_pool_in_memory().await?;
        let store = Self { pool };
        store.ensure_schema().await?;

        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r"
CREATE TABLE IF NOT EXISTS sessions (
    agent_name TEXT PRIMARY KEY,
    capability TEXT NOT NULL,
    worktree_path TEXT NOT NULL,
    branch_name TEXT NOT NULL,
    bead_id TEXT NOT NULL,
    pane_name TEXT NOT NULL,
    state TEXT NOT NULL,
    pid INTEGER,
    parent_agent TEXT,
    depth INTEGER NOT NULL DEFAULT 0,
    started_at INTEGER NOT NULL,
    last_activity INTEGER NOT NULL
)
",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    coordinator TEXT NOT NULL,
    status TEXT NOT NULL,
    agent_count INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    completed_at INTEGER
)
",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
",
        )
        .execute(&self.pool)
        .await?;

        // Columns added after the first release; safe to re-run.
        add_column_if_missing(&self.pool, "sessions", "run_id TEXT").await?;
        add_column_if_missing(&self.pool, "sessions", "stalled_since INTEGER").await?;
        add_column_if_missing(
            &self.pool,
            "sessions",
            "escalation_level INTEGER NOT NULL DEFAULT 0",
        )
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sessions_state ON sessions (state, last_activity)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_run ON sessions (run_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Imports the legacy flat session file once, returning whether it ran.
    async fn import_legacy(&self, legacy_file: Option<&Path>) -> Result<bool> {
        let Some(legacy_file) = legacy_file else {
            return Ok(false);
        };
        if !legacy_file.is_file() {
            return Ok(false);
        }

        let already_imported = sqlx::query("SELECT value FROM meta WHERE key = 'legacy_imported'")
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if already_imported {
            return Ok(false);
        }

        let session_count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM sessions")
            .fetch_one(&self.pool)
            .await?
            .get("n");
        if session_count > 0 {
            return Ok(false);
        }

        let raw = std::fs::read_to_string(legacy_file).map_err(|err| {
            Error::store(
                format!("failed to read legacy session file: {err}"),
                &[("path", &legacy_file.display().to_string())],
            )
        })?;
        let sessions: Vec<AgentSession> = serde_json::from_str(&raw).map_err(|err| {
            Error::store(
                format!("failed to parse legacy session file: {err}"),
                &[("path", &legacy_file.display().to_string())],
            )
        })?;

        for session in &sessions {
            self.upsert(session).await?;
        }

        sqlx::query("INSERT INTO meta (key, value) VALUES ('legacy_imported', '1')")
            .execute(&self.pool)
            .await?;

        Ok(true)
    }

    /// Inserts or replaces a session row by agent name.
    ///
    /// Escalation monotonicity is the watchdog's responsibility; the store
    /// writes the field as given.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] when structural invariants fail and
    /// [`Error::Store`] on database failure.
    pub async fn upsert(&self, session: &AgentSession) -> Result<()> {
        session
            .validate()
            .map_err(|message| Error::validation(message, &[("agent", &session.agent_name)]))?;

        sqlx::query(
            r"
INSERT OR REPLACE INTO sessions (agent_name, capability, worktree_path, branch_name,
    bead_id, pane_name, state, pid, parent_agent, depth, run_id, started_at,
    last_activity, stalled_since, escalation_level)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
",
        )
        .bind(&session.agent_name)
        .bind(session.capability.to_string())
        .bind(session.worktree_path.display().to_string())
        .bind(&session.branch_name)
        .bind(&session.bead_id)
        .bind(&session.pane_name)
        .bind(session.state.to_string())
        .bind(session.pid)
        .bind(&session.parent_agent)
        .bind(i64::from(session.depth))
        .bind(&session.run_id)
        .bind(session.started_at)
        .bind(session.last_activity)
        .bind(session.stalled_since)
        .bind(i64::from(session.escalation_level))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Looks up a session by agent name.
    ///
    /// # Errors
    /// Returns an error if the lookup query fails or the row is corrupt.
    pub async fn get_by_name(&self, agent_name: &str) -> Result<Option<AgentSession>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE agent_name = ?"
        ))
        .bind(agent_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_session(&row)).transpose()
    }

    /// Returns sessions in a non-terminal state, ordered by start time.
    ///
    /// # Errors
    /// Returns an error if session rows cannot be read.
    pub async fn get_active(&self) -> Result<Vec<AgentSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions
             WHERE state IN ('booting', 'working', 'stalled')
             ORDER BY started_at, agent_name"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_session).collect()
    }

    /// Returns every session, ordered by start time.
    ///
    /// # Errors
    /// Returns an error if session rows cannot be read.
    pub async fn get_all(&self) -> Result<Vec<AgentSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY started_at, agent_name"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_session).collect()
    }

    /// Returns sessions grouped under one run.
    ///
    /// # Errors
    /// Returns an error if session rows cannot be read.
    pub async fn get_by_run(&self, run_id: &str) -> Result<Vec<AgentSession>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE run_id = ?
             ORDER BY started_at, agent_name"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_session).collect()
    }

    /// Applies a forward-only state transition.
    ///
    /// The current row is re-read inside the transaction, so a stale caller
    /// cannot overwrite a newer terminal state. Entering `stalled` stamps
    /// `stalled_since`; any other target clears it. Terminal targets also
    /// reset the escalation level.
    ///
    /// # Errors
    /// Returns [`Error::Lifecycle`] for an illegal transition or an unknown
    /// agent, [`Error::Store`] on database failure.
    pub async fn update_state(&self, agent_name: &str, new_state: AgentState) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT state FROM sessions WHERE agent_name = ?")
            .bind(agent_name)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                Error::lifecycle("unknown agent session", &[("agent", agent_name)])
            })?;
        let current: AgentState = row
            .get::<String, _>("state")
            .parse()
            .map_err(|message: String| Error::store(message, &[("agent", agent_name)]))?;

        if !current.can_transition_to(new_state) {
            return Err(Error::lifecycle(
                format!("illegal state transition {current} -> {new_state}"),
                &[
                    ("agent", agent_name),
                    ("from", &current.to_string()),
                    ("to", &new_state.to_string()),
                ],
            ));
        }

        let now = unix_timestamp_now();
        let stalled_since = (new_state == AgentState::Stalled).then_some(now);
        if new_state.is_terminal() {
            sqlx::query(
                "UPDATE sessions
                 SET state = ?, stalled_since = NULL, escalation_level = 0
                 WHERE agent_name = ?",
            )
            .bind(new_state.to_string())
            .bind(agent_name)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE sessions SET state = ?, stalled_since = ? WHERE agent_name = ?",
            )
            .bind(new_state.to_string())
            .bind(stalled_since)
            .bind(agent_name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    /// Touches the last-activity timestamp for one session.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn update_last_activity(&self, agent_name: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET last_activity = ? WHERE agent_name = ?")
            .bind(unix_timestamp_now())
            .bind(agent_name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Raises the escalation level and records when the stall began.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] when `level` would decrease the stored
    /// value, [`Error::Lifecycle`] for an unknown agent.
    pub async fn update_escalation(
        &self,
        agent_name: &str,
        level: u8,
        stalled_since: Option<i64>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT escalation_level FROM sessions WHERE agent_name = ?")
            .bind(agent_name)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                Error::lifecycle("unknown agent session", &[("agent", agent_name)])
            })?;
        let current: i64 = row.get("escalation_level");

        if i64::from(level) < current {
            return Err(Error::validation(
                format!("escalation level cannot decrease from {current} to {level}"),
                &[("agent", agent_name)],
            ));
        }

        sqlx::query(
            "UPDATE sessions SET escalation_level = ?, stalled_since = ? WHERE agent_name = ?",
        )
        .bind(i64::from(level))
        .bind(stalled_since)
        .bind(agent_name)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }

    /// Deletes one session row.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn remove(&self, agent_name: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE agent_name = ?")
            .bind(agent_name)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Deletes sessions in one state, returning the count removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_by_state(&self, state: AgentState) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE state = ?")
            .bind(state.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Deletes one agent's session row, returning the count removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_by_agent(&self, agent_name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions WHERE agent_name = ?")
            .bind(agent_name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Deletes every session row, returning the count removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sessions")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Creates a new active run for one coordinator and returns it.
    ///
    /// # Errors
    /// Returns an error if the run row cannot be inserted.
    pub async fn create_run(&self, coordinator: &str) -> Result<Run> {
        let run = Run {
            run_id: Uuid::new_v4().to_string(),
            coordinator: coordinator.to_string(),
            status: RunStatus::Active,
            agent_count: 0,
            created_at: unix_timestamp_now(),
            completed_at: None,
        };

        sqlx::query(
            r"
INSERT INTO runs (run_id, coordinator, status, agent_count, created_at, completed_at)
VALUES (?, ?, ?, ?, ?, NULL)
",
        )
        .bind(&run.run_id)
        .bind(&run.coordinator)
        .bind(run.status.to_string())
        .bind(run.agent_count)
        .bind(run.created_at)
        .execute(&self.pool)
        .await?;

        Ok(run)
    }

    /// Looks up a run by identifier.
    ///
    /// # Errors
    /// Returns an error if the lookup fails or the row is corrupt.
    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let row = sqlx::query(
            "SELECT run_id, coordinator, status, agent_count, created_at, completed_at
             FROM runs WHERE run_id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_run(&row)).transpose()
    }

    /// Returns the single active run, when one exists.
    ///
    /// The latest-created active run wins if older rows were left behind by
    /// a crash.
    ///
    /// # Errors
    /// Returns an error if the lookup fails or the row is corrupt.
    pub async fn get_active_run(&self) -> Result<Option<Run>> {
        let row = sqlx::query(
            "SELECT run_id, coordinator, status, agent_count, created_at, completed_at
             FROM runs WHERE status = 'active'
             ORDER BY created_at DESC, run_id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_run(&row)).transpose()
    }

    /// Lists runs most recent first, capped at `limit`.
    ///
    /// # Errors
    /// Returns an error if run rows cannot be read.
    pub async fn list_runs(&self, limit: i64) -> Result<Vec<Run>> {
        let rows = sqlx::query(
            "SELECT run_id, coordinator, status, agent_count, created_at, completed_at
             FROM runs ORDER BY created_at DESC, run_id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_run).collect()
    }

    /// Increments the agent count for one run.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn increment_agent_count(&self, run_id: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET agent_count = agent_count + 1 WHERE run_id = ?")
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Marks a run completed, setting status and completion time atomically.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn complete_run(&self, run_id: &str) -> Result<()> {
        sqlx::query("UPDATE runs SET status = 'completed', completed_at = ? WHERE run_id = ?")
            .bind(unix_timestamp_now())
            .bind(run_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Checkpoints the WAL and closes the store.
    ///
    /// # Errors
    /// Returns an error if the checkpoint fails.
    pub async fn close(&self) -> Result<()> {
        checkpoint_and_close(&self.pool).await
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<AgentSession> {
    let capability = row
        .get::<String, _>("capability")
        .parse()
        .map_err(|message: String| Error::store(message, &[]))?;
    let state = row
        .get::<String, _>("state")
        .parse()
        .map_err(|message: String| Error::store(message, &[]))?;
    let depth = u32::try_from(row.get::<i64, _>("depth")).unwrap_or(0);
    let escalation_level = u8::try_from(row.get::<i64, _>("escalation_level")).unwrap_or(u8::MAX);

    Ok(AgentSession {
        agent_name: row.get("agent_name"),
        capability,
        worktree_path: row.get::<String, _>("worktree_path").into(),
        branch_name: row.get("branch_name"),
        bead_id: row.get("bead_id"),
        pane_name: row.get("pane_name"),
        state,
        pid: row.get("pid"),
        parent_agent: row.get("parent_agent"),
        depth,
        run_id: row.get("run_id"),
        started_at: row.get("started_at"),
        last_activity: row.get("last_activity"),
        stalled_since: row.get("stalled_since"),
        escalation_level,
    })
}

fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<Run> {
    let status = row
        .get::<String, _>("status")
        .parse()
        .map_err(|message: String| Error::store(message, &[]))?;

    Ok(Run {
        run_id: row.get("run_id"),
        coordinator: row.get("coordinator"),
        status,
        agent_count: row.get("agent_count"),
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use tempfile::tempdir;

    use super::*;
    use crate::domain::session::Capability;

    fn session(name: &str, state: AgentState) -> AgentSession {
        AgentSession {
            agent_name: name.to_string(),
            capability: Capability::Builder,
            worktree_path: PathBuf::from(format!("/tmp/worktrees/{name}")),
            branch_name: format!("overstory/{name}/task-abc"),
            bead_id: "task-abc".to_string(),
            pane_name: format!("overstory-{name}"),
            state,
            pid: Some(4242),
            parent_agent: Some("lead-1".to_string()),
            depth: 2,
            run_id: None,
            started_at: unix_timestamp_now(),
            last_activity: unix_timestamp_now(),
            stalled_since: (state == AgentState::Stalled).then(unix_timestamp_now),
            escalation_level: 0,
        }
    }

    #[tokio::test]
    async fn test_upsert_then_get_by_name_is_last_writer_wins() {
        // Arrange
        let store = SessionStore::open_in_memory()
            .await
            .expect("failed to open store");
        let mut first = session("builder-1", AgentState::Booting);
        store.upsert(&first).await.expect("failed to upsert");

        // Act
        first.state = AgentState::Working;
        first.pid = Some(5151);
        store.upsert(&first).await.expect("failed to re-upsert");
        let loaded = store
            .get_by_name("builder-1")
            .await
            .expect("failed to load")
            .expect("expected session");

        // Assert
        assert_eq!(loaded.state, AgentState::Working);
        assert_eq!(loaded.pid, Some(5151));
        assert_eq!(loaded.capability, Capability::Builder);
    }

    #[tokio::test]
    async fn test_get_active_excludes_terminal_states() {
        // Arrange
        let store = SessionStore::open_in_memory()
            .await
            .expect("failed to open store");
        store
            .upsert(&session("builder-1", AgentState::Working))
            .await
            .expect("failed to upsert working");
        store
            .upsert(&session("builder-2", AgentState::Completed))
            .await
            .expect("failed to upsert completed");
        store
            .upsert(&session("builder-3", AgentState::Zombie))
            .await
            .expect("failed to upsert zombie");

        // Act
        let active = store.get_active().await.expect("failed to load active");

        // Assert
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].agent_name, "builder-1");
    }

    #[tokio::test]
    async fn test_update_state_rejects_backward_transition() {
        // Arrange
        let store = SessionStore::open_in_memory()
            .await
            .expect("failed to open store");
        store
            .upsert(&session("builder-1", AgentState::Working))
            .await
            .expect("failed to upsert");

        // Act
        let result = store.update_state("builder-1", AgentState::Booting).await;

        // Assert
        let error = result.expect_err("expected rejected transition");
        assert_eq!(error.kind(), "lifecycle");
        let loaded = store
            .get_by_name("builder-1")
            .await
            .expect("failed to load")
            .expect("expected session");
        assert_eq!(loaded.state, AgentState::Working);
    }

    #[tokio::test]
    async fn test_update_state_to_stalled_stamps_stalled_since() {
        // Arrange
        let store = SessionStore::open_in_memory()
            .await
            .expect("failed to open store");
        store
            .upsert(&session("builder-1", AgentState::Working))
            .await
            .expect("failed to upsert");

        // Act
        store
            .update_state("builder-1", AgentState::Stalled)
            .await
            .expect("failed to stall");
        let stalled = store
            .get_by_name("builder-1")
            .await
            .expect("failed to load")
            .expect("expected session");
        store
            .update_state("builder-1", AgentState::Working)
            .await
            .expect("failed to recover");
        let recovered = store
            .get_by_name("builder-1")
            .await
            .expect("failed to load")
            .expect("expected session");

        // Assert
        assert!(stalled.stalled_since.is_some());
        assert!(recovered.stalled_since.is_none());
    }

    #[tokio::test]
    async fn test_terminal_transition_resets_escalation() {
        // Arrange
        let store = SessionStore::open_in_memory()
            .await
            .expect("failed to open store");
        store
            .upsert(&session("builder-1", AgentState::Working))
            .await
            .expect("failed to upsert");
        store
            .update_state("builder-1", AgentState::Stalled)
            .await
            .expect("failed to stall");
        store
            .update_escalation("builder-1", 3, Some(unix_timestamp_now()))
            .await
            .expect("failed to escalate");

        // Act
        store
            .update_state("builder-1", AgentState::Zombie)
            .await
            .expect("failed to terminate");
        let loaded = store
            .get_by_name("builder-1")
            .await
            .expect("failed to load")
            .expect("expected session");

        // Assert
        assert_eq!(loaded.state, AgentState::Zombie);
        assert_eq!(loaded.escalation_level, 0);
        assert!(loaded.stalled_since.is_none());
    }

    #[tokio::test]
    async fn test_update_escalation_rejects_decrease() {
        // Arrange
        let store = SessionStore::open_in_memory()
            .await
            .expect("failed to open store");
        store
            .upsert(&session("builder-1", AgentState::Working))
            .await
            .expect("failed to upsert");
        store
            .update_escalation("builder-1", 2, Some(unix_timestamp_now()))
            .await
            .expect("failed to escalate");

        // Act
        let result = store.update_escalation("builder-1", 1, None).await;

        // Assert
        let error = result.expect_err("expected rejected decrease");
        assert_eq!(error.kind(), "validation");
    }

    #[tokio::test]
    async fn test_purge_by_state_returns_count() {
        // Arrange
        let store = SessionStore::open_in_memory()
            .await
            .expect("failed to open store");
        store
            .upsert(&session("builder-1", AgentState::Zombie))
            .await
            .expect("failed to upsert");
        store
            .upsert(&session("builder-2", AgentState::Zombie))
            .await
            .expect("failed to upsert");
        store
            .upsert(&session("builder-3", AgentState::Working))
            .await
            .expect("failed to upsert");

        // Act
        let removed = store
            .purge_by_state(AgentState::Zombie)
            .await
            .expect("failed to purge");

        // Assert
        assert_eq!(removed, 2);
        assert_eq!(store.get_all().await.expect("failed to load").len(), 1);
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        // Arrange
        let store = SessionStore::open_in_memory()
            .await
            .expect("failed to open store");

        // Act
        let run = store
            .create_run("coordinator-1")
            .await
            .expect("failed to create run");
        store
            .increment_agent_count(&run.run_id)
            .await
            .expect("failed to increment");
        store
            .increment_agent_count(&run.run_id)
            .await
            .expect("failed to increment");
        let active = store
            .get_active_run()
            .await
            .expect("failed to load active run");
        store
            .complete_run(&run.run_id)
            .await
            .expect("failed to complete run");
        let completed = store
            .get_run(&run.run_id)
            .await
            .expect("failed to load run")
            .expect("expected run");

        // Assert
        assert_eq!(
            active.as_ref().map(|active| active.run_id.as_str()),
            Some(run.run_id.as_str())
        );
        assert_eq!(completed.agent_count, 2);
        assert_eq!(completed.status, RunStatus::Completed);
        assert!(completed.completed_at.is_some());
        assert!(
            store
                .get_active_run()
                .await
                .expect("failed to reload active run")
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_legacy_import_runs_once() {
        // Arrange
        let dir = tempdir().expect("failed to create temp dir");
        let db_path = dir.path().join("sessions.db");
        let legacy_path = dir.path().join("agents.json");
        let legacy = vec![session("builder-1", AgentState::Working)];
        std::fs::write(
            &legacy_path,
            serde_json::to_string(&legacy).expect("failed to serialize legacy file"),
        )
        .expect("failed to write legacy file");

        // Act
        let first_open = SessionStore::open(&db_path, Some(&legacy_path))
            .await
            .expect("failed to open store");
        first_open.store.close().await.expect("failed to close");
        let second_open = SessionStore::open(&db_path, Some(&legacy_path))
            .await
            .expect("failed to reopen store");

        // Assert
        assert!(first_open.legacy_imported);
        assert!(!second_open.legacy_imported);
        let loaded = second_open
            .store
            .get_by_name("builder-1")
            .await
            .expect("failed to load")
            .expect("expected imported session");
        assert_eq!(loaded.branch_name, "overstory/builder-1/task-abc");
    }
}
