//! Agent session handles, keyed by workspace folder.

use super::Store;
use crate::error::Result;
use sqlx::Row as _;

impl Store {
    pub async fn session_for(&self, folder: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT session_id FROM sessions WHERE folder = ?")
            .bind(folder)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.and_then(|r| r.try_get("session_id").ok()))
    }

    /// Store or replace the session handle returned by an agent run.
    pub async fn store_session(&self, folder: &str, session_id: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (folder, session_id, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(folder) DO UPDATE SET
                session_id = excluded.session_id,
                updated_at = excluded.updated_at",
        )
        .bind(folder)
        .bind(session_id)
        .bind(crate::now_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Drop the stored session so the next run starts a fresh conversation.
    pub async fn clear_session(&self, folder: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE folder = ?")
            .bind(folder)
            .execute(self.pool())
            .await?;
        Ok(())
    }
}
