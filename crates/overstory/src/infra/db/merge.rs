//! Durable FIFO merge queue.
//!
//! Ordering follows the monotonic insert sequence, not `enqueued_at`, so
//! clock skew between producers cannot reorder integrations.

use std::path::Path;

use sqlx::{Row, SqlitePool};

use crate::domain::merge::{MergeEntry, MergeStatus, MergeTier};
use crate::error::{Error, Result};
use crate::infra::db::{
    checkpoint_and_close, open_pool, open_pool_in_memory, unix_timestamp_now,
};

const MERGE_COLUMNS: &str =
    "branch_name, bead_id, agent_name, files, status, resolved_tier, enqueued_at";

/// Durable FIFO queue of branch integrations.
#[derive(Clone)]
pub struct MergeQueueStore {
    pool: SqlitePool,
}

impl MergeQueueStore {
    /// Opens the merge queue database and applies idempotent schema setup.
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
CREATE TABLE IF NOT EXISTS merge_queue (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    branch_name TEXT NOT NULL UNIQUE,
    bead_id TEXT NOT NULL,
    agent_name TEXT NOT NULL,
    files TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    resolved_tier TEXT,
    enqueued_at INTEGER NOT NULL
)
",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_merge_status ON merge_queue (status, seq)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Appends one entry to the queue tail, stamping `enqueued_at` when
    /// unset.
    ///
    /// # Errors
    /// Returns [`Error::Merge`] when the branch is already queued.
    pub async fn enqueue(&self, entry: &MergeEntry) -> Result<()> {
        let files = serde_json::to_string(&entry.files).map_err(|err| {
            Error::merge(
                format!("failed to encode file list: {err}"),
                &entry.branch_name,
                None,
            )
        })?;
        let enqueued_at = if entry.enqueued_at == 0 {
            unix_timestamp_now()
        } else {
            entry.enqueued_at
        };

        sqlx::query(
            r"
INSERT INTO merge_queue (branch_name, bead_id, agent_name, files, status, resolved_tier,
    enqueued_at)
VALUES (?, ?, ?, ?, ?, NULL, ?)
",
        )
        .bind(&entry.branch_name)
        .bind(&entry.bead_id)
        .bind(&entry.agent_name)
        .bind(files)
        .bind(MergeStatus::Pending.to_string())
        .bind(enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            Error::merge(
                format!("failed to enqueue branch: {err}"),
                &entry.branch_name,
                None,
            )
        })?;

        Ok(())
    }

    /// Pops the FIFO-head pending entry and flips it to `merging`.
    ///
    /// The select and the status flip run in one transaction so two
    /// resolvers can never claim the same entry.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn dequeue(&self) -> Result<Option<MergeEntry>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {MERGE_COLUMNS} FROM merge_queue WHERE status = 'pending'
             ORDER BY seq ASC LIMIT 1"
        ))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut entry = row_to_entry(&row)?;
        entry.status = MergeStatus::Merging;

        sqlx::query("UPDATE merge_queue SET status = 'merging' WHERE branch_name = ?")
            .bind(&entry.branch_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(entry))
    }

    /// Returns the FIFO-head pending entry without claiming it.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    pub async fn peek(&self) -> Result<Option<MergeEntry>> {
        let row = sqlx::query(&format!(
            "SELECT {MERGE_COLUMNS} FROM merge_queue WHERE status = 'pending'
             ORDER BY seq ASC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| row_to_entry(&row)).transpose()
    }

    /// Lists entries in insert order, optionally restricted to one status.
    ///
    /// # Errors
    /// Returns an error if queue rows cannot be read.
    pub async fn list(&self, status: Option<MergeStatus>) -> Result<Vec<MergeEntry>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {MERGE_COLUMNS} FROM merge_queue WHERE status = ?
                     ORDER BY seq ASC"
                ))
                .bind(status.to_string())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {MERGE_COLUMNS} FROM merge_queue ORDER BY seq ASC"
                ))
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter().map(row_to_entry).collect()
    }

    /// Updates the status (and optionally the resolved tier) for one branch.
    ///
    /// # Errors
    /// Returns [`Error::Merge`] when the branch is not queued.
    pub async fn update_status(
        &self,
        branch_name: &str,
        status: MergeStatus,
        tier: Option<MergeTier>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE merge_queue SET status = ?, resolved_tier = ? WHERE branch_name = ?",
        )
        .bind(status.to_string())
        .bind(tier.map(|tier| tier.to_string()))
        .bind(branch_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::merge("branch not found in queue", branch_name, None));
        }

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

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> Result<MergeEntry> {
    let status: MergeStatus = row
        .get::<String, _>("status")
        .parse()
        .map_err(|message: String| Error::store(message, &[]))?;
    let resolved_tier = row
        .get::<Option<String>, _>("resolved_tier")
        .map(|raw| raw.parse::<MergeTier>())
        .transpose()
        .map_err(|message: String| Error::store(message, &[]))?;
    let files: Vec<String> = serde_json::from_str(row.get::<String, _>("files").as_str())
        .map_err(|err| Error::store(format!("corrupt file list: {err}"), &[]))?;

    Ok(MergeEntry {
        branch_name: row.get("branch_name"),
        bead_id: row.get("bead_id"),
        agent_name: row.get("agent_name"),
        files,
        status,
        resolved_tier,
        enqueued_at: row.get("enqueued_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(branch: &str) -> MergeEntry {
        MergeEntry::new(branch, "task-abc", "builder-1", vec!["src/a.rs".to_string()])
    }

    #[tokio::test]
    async fn test_dequeue_follows_insert_order() {
        // Arrange
        let store = MergeQueueStore::open_in_memory()
            .await
            .expect("failed to open store");
        let mut second = entry("overstory/b/task-2");
        // Later enqueued_at on the first entry must not reorder the queue.
        second.enqueued_at = 1;
        let mut first = entry("overstory/a/task-1");
        first.enqueued_at = 9_999_999_999;
        store.enqueue(&first).await.expect("failed to enqueue");
        store.enqueue(&second).await.expect("failed to enqueue");

        // Act
        let popped_first = store.dequeue().await.expect("failed to dequeue");
        let popped_second = store.dequeue().await.expect("failed to dequeue");
        let popped_third = store.dequeue().await.expect("failed to dequeue");

        // Assert — insert order, not timestamp order
        assert_eq!(
            popped_first.map(|entry| entry.branch_name),
            Some("overstory/a/task-1".to_string())
        );
        assert_eq!(
            popped_second.map(|entry| entry.branch_name),
            Some("overstory/b/task-2".to_string())
        );
        assert!(popped_third.is_none());
    }

    #[tokio::test]
    async fn test_dequeue_flips_status_to_merging() {
        // Arrange
        let store = MergeQueueStore::open_in_memory()
            .await
            .expect("failed to open store");
        store
            .enqueue(&entry("overstory/a/task-1"))
            .await
            .expect("failed to enqueue");

        // Act
        let popped = store
            .dequeue()
            .await
            .expect("failed to dequeue")
            .expect("expected entry");
        let listed = store
            .list(Some(MergeStatus::Merging))
            .await
            .expect("failed to list");

        // Assert
        assert_eq!(popped.status, MergeStatus::Merging);
        assert_eq!(listed.len(), 1);
        assert!(
            store
                .peek()
                .await
                .expect("failed to peek")
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_enqueue_duplicate_branch_is_rejected() {
        // Arrange
        let store = MergeQueueStore::open_in_memory()
            .await
            .expect("failed to open store");
        store
            .enqueue(&entry("overstory/a/task-1"))
            .await
            .expect("failed to enqueue");

        // Act
        let result = store.enqueue(&entry("overstory/a/task-1")).await;

        // Assert
        let error = result.expect_err("expected duplicate rejection");
        assert_eq!(error.kind(), "merge");
    }

    #[tokio::test]
    async fn test_update_status_records_resolved_tier() {
        // Arrange
        let store = MergeQueueStore::open_in_memory()
            .await
            .expect("failed to open store");
        store
            .enqueue(&entry("overstory/a/task-1"))
            .await
            .expect("failed to enqueue");
        store.dequeue().await.expect("failed to dequeue");

        // Act
        store
            .update_status(
                "overstory/a/task-1",
                MergeStatus::Merged,
                Some(MergeTier::AutoResolve),
            )
            .await
            .expect("failed to update status");
        let merged = store
            .list(Some(MergeStatus::Merged))
            .await
            .expect("failed to list");

        // Assert
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].resolved_tier, Some(MergeTier::AutoResolve));
        assert_eq!(merged[0].files, vec!["src/a.rs".to_string()]);
    }

    #[tokio::test]
    async fn test_update_status_unknown_branch_is_merge_error() {
        // Arrange
        let store = MergeQueueStore::open_in_memory()
            .await
            .expect("failed to open store");

        // Act
        let result = store
            .update_status("missing", MergeStatus::Failed, None)
            .await;

        // Assert
        let error = result.expect_err("expected missing branch error");
        assert_eq!(error.kind(), "merge");
    }

    #[tokio::test]
    async fn test_peek_does_not_claim_entry() {
        // Arrange
        let store = MergeQueueStore::open_in_memory()
            .await
            .expect("failed to open store");
        store
            .enqueue(&entry("overstory/a/task-1"))
            .await
            .expect("failed to enqueue");

        // Act
        let peeked = store.peek().await.expect("failed to peek");
        let still_pending = store
            .list(Some(MergeStatus::Pending))
            .await
            .expect("failed to list");

        // Assert
        assert!(peeked.is_some());
        assert_eq!(still_pending.len(), 1);
    }
}
