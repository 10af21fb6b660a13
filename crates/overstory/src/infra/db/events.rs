//! Insert-only event log with in-store tool correlation.
//!
//! Producers append structured events; the watchdog and insight analyzer
//! read them back. `tool_end` events are paired with their `tool_start` by
//! [`EventStore::correlate_tool_end`], which back-fills the start row's
//! duration.

use std::path::Path;

use sqlx::{Row, SqlitePool};

use crate::domain::event::{
    EventKind, EventLevel, SessionMetrics, StoredEvent, TokenSnapshot, ToolStat,
};
use crate::error::{Error, Result};
use crate::infra::db::{
    checkpoint_and_close, open_pool, open_pool_in_memory, unix_timestamp_ms_now,
};

const EVENT_COLUMNS: &str = "id, run_id, agent_name, session_id, event_kind, tool_name, \
     tool_args, tool_duration_ms, level, payload, created_at";

/// Durable append-only store for [`StoredEvent`] rows plus session metrics
/// and token snapshots.
#[derive(Clone)]
pub struct EventStore {
    pool: SqlitePool,
}

impl EventStore {
    /// Opens the event database and applies idempotent schema setup.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = open_pool(db_path).await?;
        let store = Self { pool };
        store.ensure_schema().await?;

        Ok(store)
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
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT,
    agent_name TEXT NOT NULL,
    session_id TEXT,
    event_kind TEXT NOT NULL,
    tool_name TEXT,
    tool_args TEXT,
    tool_duration_ms INTEGER,
    level TEXT NOT NULL,
    payload TEXT,
    created_at INTEGER NOT NULL
)
",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
CREATE TABLE IF NOT EXISTS session_metrics (
    agent_name TEXT NOT NULL,
    bead_id TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    tool_calls INTEGER NOT NULL,
    error_count INTEGER NOT NULL,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    completed INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (agent_name, bead_id)
)
",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
CREATE TABLE IF NOT EXISTS token_snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    agent_name TEXT NOT NULL,
    input_tokens INTEGER NOT NULL,
    output_tokens INTEGER NOT NULL,
    created_at INTEGER NOT NULL
)
",
        )
        .execute(&self.pool)
        .await?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_events_agent_created ON events (agent_name, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_run_created ON events (run_id, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_kind_created ON events (event_kind, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_events_tool_agent ON events (tool_name, agent_name)",
            "CREATE INDEX IF NOT EXISTS idx_events_errors ON events (created_at) WHERE level = 'error'",
        ] {
            sqlx::query(ddl).execute(&self.pool).await?;
        }

        Ok(())
    }

    /// Appends one event, stamping `created_at` when unset, and returns the
    /// assigned row id.
    ///
    /// # Errors
    /// Returns an error if the row cannot be written.
    pub async fn insert(&self, event: &StoredEvent) -> Result<i64> {
        let created_at = if event.created_at == 0 {
            unix_timestamp_ms_now()
        } else {
            event.created_at
        };

        let result = sqlx::query(
            r"
INSERT INTO events (run_id, agent_name, session_id, event_kind, tool_name, tool_args,
    tool_duration_ms, level, payload, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
",
        )
        .bind(&event.run_id)
        .bind(&event.agent_name)
        .bind(&event.session_id)
        .bind(event.kind.to_string())
        .bind(&event.tool_name)
        .bind(&event.tool_args)
        .bind(event.tool_duration_ms)
        .bind(event.level.to_string())
        .bind(&event.payload)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// Pairs the most recent unmatched `tool_start` for `(agent, tool)` with
    /// a `tool_end` happening now.
    ///
    /// Back-fills the start row's `tool_duration_ms` and returns the start
    /// id and the duration. Returns `None` when no unmatched start exists;
    /// callers still insert the `tool_end` event in that case.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn correlate_tool_end(
        &self,
        agent_name: &str,
        tool_name: &str,
    ) -> Result<Option<(i64, i64)>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, created_at FROM events
             WHERE agent_name = ? AND tool_name = ? AND event_kind = 'tool_start'
               AND tool_duration_ms IS NULL
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(agent_name)
        .bind(tool_name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let start_id: i64 = row.get("id");
        let started_at: i64 = row.get("created_at");
        let duration_ms = (unix_timestamp_ms_now() - started_at).max(0);

        sqlx::query("UPDATE events SET tool_duration_ms = ? WHERE id = ?")
            .bind(duration_ms)
            .bind(start_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some((start_id, duration_ms)))
    }

    /// Returns one agent's events, newest first, capped at `limit`.
    ///
    /// # Errors
    /// Returns an error if event rows cannot be read.
    pub async fn by_agent(&self, agent_name: &str, limit: i64) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE agent_name = ?
             ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(agent_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    /// Returns one run's events in chronological order.
    ///
    /// # Errors
    /// Returns an error if event rows cannot be read.
    pub async fn by_run(&self, run_id: &str) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE run_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    /// Returns error-level events across all agents, newest first.
    ///
    /// # Errors
    /// Returns an error if event rows cannot be read.
    pub async fn errors(&self, limit: i64) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE level = 'error'
             ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    /// Returns all events at or after `since_ms` in global chronological
    /// order, id as tiebreak.
    ///
    /// # Errors
    /// Returns an error if event rows cannot be read.
    pub async fn timeline(&self, since_ms: i64) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE created_at >= ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(since_ms)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    /// Aggregates per-tool call counts and durations.
    ///
    /// Durations come only from correlated `tool_start` rows; unmatched
    /// starts count toward `count` but not toward the averages.
    ///
    /// # Errors
    /// Returns an error if the aggregate query fails.
    pub async fn tool_stats(&self) -> Result<Vec<ToolStat>> {
        let rows = sqlx::query(
            r"
SELECT tool_name,
       COUNT(*) AS call_count,
       COALESCE(AVG(tool_duration_ms), 0.0) AS avg_duration_ms,
       COALESCE(MAX(tool_duration_ms), 0) AS max_duration_ms
FROM events
WHERE event_kind = 'tool_start' AND tool_name IS NOT NULL
GROUP BY tool_name
ORDER BY call_count DESC, tool_name
",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| ToolStat {
                tool_name: row.get("tool_name"),
                count: row.get("call_count"),
                avg_duration_ms: row.get("avg_duration_ms"),
                max_duration_ms: row.get("max_duration_ms"),
            })
            .collect())
    }

    /// Deletes events created before `cutoff_ms`, returning the count.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_by_age(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE created_at < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Deletes one agent's events, returning the count.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_by_agent(&self, agent_name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE agent_name = ?")
            .bind(agent_name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Deletes every event, returning the count.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Inserts or replaces the metrics summary for `(agent, bead)`.
    ///
    /// # Errors
    /// Returns an error if the upsert fails.
    pub async fn upsert_metrics(&self, metrics: &SessionMetrics) -> Result<()> {
        let created_at = if metrics.created_at == 0 {
            unix_timestamp_ms_now()
        } else {
            metrics.created_at
        };

        sqlx::query(
            r"
INSERT OR REPLACE INTO session_metrics (agent_name, bead_id, duration_ms, tool_calls,
    error_count, input_tokens, output_tokens, completed, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
",
        )
        .bind(&metrics.agent_name)
        .bind(&metrics.bead_id)
        .bind(metrics.duration_ms)
        .bind(metrics.tool_calls)
        .bind(metrics.error_count)
        .bind(metrics.input_tokens)
        .bind(metrics.output_tokens)
        .bind(i64::from(metrics.completed))
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Looks up the metrics summary for `(agent, bead)`.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    pub async fn get_metrics(
        &self,
        agent_name: &str,
        bead_id: &str,
    ) -> Result<Option<SessionMetrics>> {
        let row = sqlx::query(
            "SELECT agent_name, bead_id, duration_ms, tool_calls, error_count,
                    input_tokens, output_tokens, completed, created_at
             FROM session_metrics WHERE agent_name = ? AND bead_id = ?",
        )
        .bind(agent_name)
        .bind(bead_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| SessionMetrics {
            agent_name: row.get("agent_name"),
            bead_id: row.get("bead_id"),
            duration_ms: row.get("duration_ms"),
            tool_calls: row.get("tool_calls"),
            error_count: row.get("error_count"),
            input_tokens: row.get("input_tokens"),
            output_tokens: row.get("output_tokens"),
            completed: row.get::<i64, _>("completed") != 0,
            created_at: row.get("created_at"),
        }))
    }

    /// Appends one token snapshot, stamping `created_at` when unset.
    ///
    /// # Errors
    /// Returns an error if the row cannot be written.
    pub async fn insert_token_snapshot(&self, snapshot: &TokenSnapshot) -> Result<()> {
        let created_at = if snapshot.created_at == 0 {
            unix_timestamp_ms_now()
        } else {
            snapshot.created_at
        };

        sqlx::query(
            r"
INSERT INTO token_snapshots (agent_name, input_tokens, output_tokens, created_at)
VALUES (?, ?, ?, ?)
",
        )
        .bind(&snapshot.agent_name)
        .bind(snapshot.input_tokens)
        .bind(snapshot.output_tokens)
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Returns one agent's token snapshots in chronological order.
    ///
    /// # Errors
    /// Returns an error if snapshot rows cannot be read.
    pub async fn token_snapshots(&self, agent_name: &str) -> Result<Vec<TokenSnapshot>> {
        let rows = sqlx::query(
            "SELECT agent_name, input_tokens, output_tokens, created_at
             FROM token_snapshots WHERE agent_name = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(agent_name)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| TokenSnapshot {
                agent_name: row.get("agent_name"),
                input_tokens: row.get("input_tokens"),
                output_tokens: row.get("output_tokens"),
                created_at: row.get("created_at"),
            })
            .collect())
    }

    /// Checkpoints the WAL and closes the store.
    ///
    /// # Errors
    /// Returns an error if the checkpoint fails.
    pub async fn close(&self) -> Result<()> {
        checkpoint_and_close(&self.pool).await
    }
}

fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<StoredEvent> {
    let kind: EventKind = row
        .get::<String, _>("event_kind")
        .parse()
        .map_err(|message: String| Error::store(message, &[]))?;
    let level: EventLevel = row
        .get::<String, _>("level")
        .parse()
        .map_err(|message: String| Error::store(message, &[]))?;

    Ok(StoredEvent {
        id: row.get("id"),
        run_id: row.get("run_id"),
        agent_name: row.get("agent_name"),
        session_id: row.get("session_id"),
        kind,
        tool_name: row.get("tool_name"),
        tool_args: row.get("tool_args"),
        tool_duration_ms: row.get("tool_duration_ms"),
        level,
        payload: row.get("payload"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_then_timeline_contains_event() {
        // Arrange
        let store = EventStore::open_in_memory()
            .await
            .expect("failed to open store");
        let mut event = StoredEvent::new("builder-1", EventKind::SessionStart);
        event.created_at = 10_000;

        // Act
        let id = store.insert(&event).await.expect("failed to insert");
        let timeline = store.timeline(0).await.expect("failed to load timeline");

        // Assert
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].id, id);
        assert_eq!(timeline[0].kind, EventKind::SessionStart);
    }

    #[tokio::test]
    async fn test_correlate_tool_end_back_fills_duration() {
        // Arrange
        let store = EventStore::open_in_memory()
            .await
            .expect("failed to open store");
        let mut start = StoredEvent::tool("agent1", EventKind::ToolStart, "Read");
        start.created_at = unix_timestamp_ms_now() - 1_500;
        let start_id = store.insert(&start).await.expect("failed to insert start");
        store
            .insert(&StoredEvent::tool("agent1", EventKind::ToolEnd, "Read"))
            .await
            .expect("failed to insert end");

        // Act
        let correlated = store
            .correlate_tool_end("agent1", "Read")
            .await
            .expect("failed to correlate");

        // Assert
        let (id, duration_ms) = correlated.expect("expected a correlation");
        assert_eq!(id, start_id);
        assert!((1_400..=2_500).contains(&duration_ms), "got {duration_ms}");
        let events = store.by_agent("agent1", 10).await.expect("failed to load");
        let start_row = events
            .iter()
            .find(|event| event.id == start_id)
            .expect("expected start row");
        assert_eq!(start_row.tool_duration_ms, Some(duration_ms));
    }

    #[tokio::test]
    async fn test_correlate_tool_end_second_call_returns_none() {
        // Arrange
        let store = EventStore::open_in_memory()
            .await
            .expect("failed to open store");
        store
            .insert(&StoredEvent::tool("agent1", EventKind::ToolStart, "Read"))
            .await
            .expect("failed to insert start");
        store
            .correlate_tool_end("agent1", "Read")
            .await
            .expect("failed to correlate")
            .expect("expected first correlation");

        // Act
        let second = store
            .correlate_tool_end("agent1", "Read")
            .await
            .expect("failed to correlate again");

        // Assert
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_correlate_tool_end_scopes_to_agent_and_tool() {
        // Arrange
        let store = EventStore::open_in_memory()
            .await
            .expect("failed to open store");
        store
            .insert(&StoredEvent::tool("agent1", EventKind::ToolStart, "Read"))
            .await
            .expect("failed to insert");
        store
            .insert(&StoredEvent::tool("agent2", EventKind::ToolStart, "Read"))
            .await
            .expect("failed to insert");

        // Act
        let correlated = store
            .correlate_tool_end("agent2", "Read")
            .await
            .expect("failed to correlate");
        let leftover = store
            .correlate_tool_end("agent1", "Bash")
            .await
            .expect("failed to correlate other tool");

        // Assert
        assert!(correlated.is_some());
        assert!(leftover.is_none());
    }

    #[tokio::test]
    async fn test_tool_stats_skips_null_durations_in_averages() {
        // Arrange
        let store = EventStore::open_in_memory()
            .await
            .expect("failed to open store");
        let mut with_duration = StoredEvent::tool("agent1", EventKind::ToolStart, "Bash");
        with_duration.tool_duration_ms = Some(400);
        store
            .insert(&with_duration)
            .await
            .expect("failed to insert");
        let mut slower = StoredEvent::tool("agent1", EventKind::ToolStart, "Bash");
        slower.tool_duration_ms = Some(800);
        store.insert(&slower).await.expect("failed to insert");
        store
            .insert(&StoredEvent::tool("agent1", EventKind::ToolStart, "Bash"))
            .await
            .expect("failed to insert unmatched start");

        // Act
        let stats = store.tool_stats().await.expect("failed to aggregate");

        // Assert — count includes the unmatched start, averages do not
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].tool_name, "Bash");
        assert_eq!(stats[0].count, 3);
        assert!((stats[0].avg_duration_ms - 600.0).abs() < f64::EPSILON);
        assert_eq!(stats[0].max_duration_ms, 800);
    }

    #[tokio::test]
    async fn test_errors_returns_error_level_events_across_agents() {
        // Arrange
        let store = EventStore::open_in_memory()
            .await
            .expect("failed to open store");
        let mut failed = StoredEvent::new("agent1", EventKind::Error);
        failed.level = EventLevel::Error;
        store.insert(&failed).await.expect("failed to insert");
        let mut other = StoredEvent::new("agent2", EventKind::Error);
        other.level = EventLevel::Error;
        store.insert(&other).await.expect("failed to insert");
        store
            .insert(&StoredEvent::new("agent1", EventKind::SessionStart))
            .await
            .expect("failed to insert info event");

        // Act
        let errors = store.errors(10).await.expect("failed to load errors");

        // Assert
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|event| event.level == EventLevel::Error));
    }

    #[tokio::test]
    async fn test_metrics_upsert_replaces_by_agent_and_bead() {
        // Arrange
        let store = EventStore::open_in_memory()
            .await
            .expect("failed to open store");
        let mut metrics = SessionMetrics {
            agent_name: "builder-1".to_string(),
            bead_id: "task-abc".to_string(),
            duration_ms: 1_000,
            tool_calls: 4,
            error_count: 0,
            input_tokens: 100,
            output_tokens: 50,
            completed: false,
            created_at: 0,
        };
        store
            .upsert_metrics(&metrics)
            .await
            .expect("failed to upsert");

        // Act
        metrics.completed = true;
        metrics.tool_calls = 9;
        store
            .upsert_metrics(&metrics)
            .await
            .expect("failed to re-upsert");
        let loaded = store
            .get_metrics("builder-1", "task-abc")
            .await
            .expect("failed to load")
            .expect("expected metrics");

        // Assert
        assert!(loaded.completed);
        assert_eq!(loaded.tool_calls, 9);
    }

    #[tokio::test]
    async fn test_token_snapshots_are_insert_only_and_ordered() {
        // Arrange
        let store = EventStore::open_in_memory()
            .await
            .expect("failed to open store");
        for (input_tokens, created_at) in [(100, 1_000), (250, 2_000)] {
            store
                .insert_token_snapshot(&TokenSnapshot {
                    agent_name: "builder-1".to_string(),
                    input_tokens,
                    output_tokens: input_tokens / 2,
                    created_at,
                })
                .await
                .expect("failed to insert snapshot");
        }

        // Act
        let snapshots = store
            .token_snapshots("builder-1")
            .await
            .expect("failed to load snapshots");

        // Assert
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].input_tokens, 100);
        assert_eq!(snapshots[1].input_tokens, 250);
    }

    #[tokio::test]
    async fn test_purge_by_age_returns_count() {
        // Arrange
        let store = EventStore::open_in_memory()
            .await
            .expect("failed to open store");
        let mut old = StoredEvent::new("agent1", EventKind::Custom);
        old.created_at = 1_000;
        store.insert(&old).await.expect("failed to insert");
        let mut fresh = StoredEvent::new("agent1", EventKind::Custom);
        fresh.created_at = 9_000;
        store.insert(&fresh).await.expect("failed to insert");

        // Act
        let removed = store.purge_by_age(5_000).await.expect("failed to purge");

        // Assert
        assert_eq!(removed, 1);
        assert_eq!(store.timeline(0).await.expect("failed to load").len(), 1);
    }
}
