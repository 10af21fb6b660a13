//! Durable mailbox store for inter-agent messages.
//!
//! The hot path for inter-process signaling: senders insert, readers either
//! peek (`get_unread`) or atomically consume (`take_unread`). Ordering is
//! `created_at` ascending with id as the tiebreak, so a recipient always
//! drains its mailbox in send order.

use std::path::Path;

use sqlx::{Row, SqlitePool};

use crate::domain::mail::{MailFilter, MailMessage, generate_mail_id};
use crate::error::{Error, Result};
use crate::infra::db::{
    checkpoint_and_close, open_pool, open_pool_in_memory, unix_timestamp_ms_now,
};

const MAIL_COLUMNS: &str = "id, from_agent, to_agent, subject, body, mail_type, priority, \
     thread_id, payload, read, created_at";

/// Durable store for [`MailMessage`] rows.
#[derive(Clone)]
pub struct MailStore {
    pool: SqlitePool,
}

impl MailStore {
    /// Opens the mail database and applies idempotent schema setup.
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
CREATE TABLE IF NOT EXISTS mail (
    id TEXT PRIMARY KEY,
    from_agent TEXT NOT NULL,
    to_agent TEXT NOT NULL,
    subject TEXT NOT NULL,
    body TEXT NOT NULL,
    mail_type TEXT NOT NULL,
    priority TEXT NOT NULL,
    thread_id TEXT,
    payload TEXT,
    read INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
)
",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_mail_to_read ON mail (to_agent, read, created_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_mail_thread ON mail (thread_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Inserts one message, generating id and `created_at` when unset.
    ///
    /// # Errors
    /// Returns an error if the row cannot be written.
    pub async fn insert(&self, message: &MailMessage) -> Result<String> {
        let id = if message.id.is_empty() {
            generate_mail_id()
        } else {
            message.id.clone()
        };
        let created_at = if message.created_at == 0 {
            unix_timestamp_ms_now()
        } else {
            message.created_at
        };

        sqlx::query(
            r"
INSERT INTO mail (id, from_agent, to_agent, subject, body, mail_type, priority,
    thread_id, payload, read, created_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
",
        )
        .bind(&id)
        .bind(&message.from)
        .bind(&message.to)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(message.mail_type.to_string())
        .bind(message.priority.to_string())
        .bind(&message.thread_id)
        .bind(&message.payload)
        .bind(i64::from(message.read))
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| Error::mail(format!("failed to insert message: {err}"), &id))?;

        Ok(id)
    }

    /// Returns unread messages for one recipient in send order.
    ///
    /// # Errors
    /// Returns an error if mail rows cannot be read.
    pub async fn get_unread(&self, agent_name: &str) -> Result<Vec<MailMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MAIL_COLUMNS} FROM mail
             WHERE to_agent = ? AND read = 0
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(agent_name)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    /// Atomically fetches unread messages and marks them read.
    ///
    /// The returned snapshot reflects the pre-mark state; a concurrent
    /// reader sees either all of these messages as read or none of them.
    ///
    /// # Errors
    /// Returns an error if the transaction fails.
    pub async fn take_unread(&self, agent_name: &str) -> Result<Vec<MailMessage>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(&format!(
            "SELECT {MAIL_COLUMNS} FROM mail
             WHERE to_agent = ? AND read = 0
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(agent_name)
        .fetch_all(&mut *tx)
        .await?;
        let messages: Vec<MailMessage> = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>>>()?;

        for message in &messages {
            sqlx::query("UPDATE mail SET read = 1 WHERE id = ?")
                .bind(&message.id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        Ok(messages)
    }

    /// Returns messages matching a dynamic filter, newest first.
    ///
    /// # Errors
    /// Returns an error if mail rows cannot be read.
    pub async fn get_all(&self, filter: &MailFilter) -> Result<Vec<MailMessage>> {
        let mut sql = format!("SELECT {MAIL_COLUMNS} FROM mail WHERE 1 = 1");
        if filter.from.is_some() {
            sql.push_str(" AND from_agent = ?");
        }
        if filter.to.is_some() {
            sql.push_str(" AND to_agent = ?");
        }
        if filter.unread_only {
            sql.push_str(" AND read = 0");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(from) = &filter.from {
            query = query.bind(from);
        }
        if let Some(to) = &filter.to {
            query = query.bind(to);
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit);
        }

        let rows = query.fetch_all(&self.pool).await?;

        rows.iter().map(row_to_message).collect()
    }

    /// Looks up one message by id.
    ///
    /// # Errors
    /// Returns an error if the lookup fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<MailMessage>> {
        let row = sqlx::query(&format!("SELECT {MAIL_COLUMNS} FROM mail WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row_to_message(&row)).transpose()
    }

    /// Returns a conversation: the thread root plus every reply, in order.
    ///
    /// # Errors
    /// Returns an error if mail rows cannot be read.
    pub async fn get_by_thread(&self, thread_id: &str) -> Result<Vec<MailMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {MAIL_COLUMNS} FROM mail
             WHERE id = ? OR thread_id = ?
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(thread_id)
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_message).collect()
    }

    /// Marks one message read.
    ///
    /// # Errors
    /// Returns [`Error::Mail`] when the id does not exist.
    pub async fn mark_read(&self, id: &str) -> Result<()> {
        let result = sqlx::query("UPDATE mail SET read = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::mail("message not found", id));
        }

        Ok(())
    }

    /// Deletes messages created before `cutoff_ms`, returning the count.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_by_age(&self, cutoff_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM mail WHERE created_at < ?")
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Deletes messages sent by or to one agent, returning the count.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_by_agent(&self, agent_name: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM mail WHERE from_agent = ? OR to_agent = ?")
            .bind(agent_name)
            .bind(agent_name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Deletes every message, returning the count.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn purge_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM mail").execute(&self.pool).await?;

        Ok(result.rows_affected())
    }

    /// Checkpoints the WAL and closes the store.
    ///
    /// # Errors
    /// Returns an error if the checkpoint fails.
    pub async fn close(&self) -> Result<()> {
        checkpoint_and_close(&self.pool).await
    }
}

fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<MailMessage> {
    let mail_type = row
        .get::<String, _>("mail_type")
        .parse()
        .map_err(|message: String| Error::store(message, &[]))?;
    let priority = row
        .get::<String, _>("priority")
        .parse()
        .map_err(|message: String| Error::store(message, &[]))?;

    Ok(MailMessage {
        id: row.get("id"),
        from: row.get("from_agent"),
        to: row.get("to_agent"),
        subject: row.get("subject"),
        body: row.get("body"),
        mail_type,
        priority,
        thread_id: row.get("thread_id"),
        payload: row.get("payload"),
        read: row.get::<i64, _>("read") != 0,
        created_at: row.get("created_at"),
    })
}
