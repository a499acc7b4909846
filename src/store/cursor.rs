//! Router cursors: the global ingestion high-watermark and the per-chat
//! agent high-watermarks. Both only ever move forward.

use super::Store;
use crate::error::Result;
use sqlx::Row as _;

const LAST_TIMESTAMP_KEY: &str = "last_timestamp";

impl Store {
    /// Global ingestion high-watermark across all registered chats.
    pub async fn last_timestamp(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM router_state WHERE key = ?")
            .bind(LAST_TIMESTAMP_KEY)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.and_then(|r| r.try_get("value").ok()))
    }

    /// Advance the global high-watermark. A value below the stored one is
    /// ignored, keeping the cursor monotone.
    pub async fn advance_last_timestamp(&self, timestamp: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO router_state (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = MAX(value, excluded.value)",
        )
        .bind(LAST_TIMESTAMP_KEY)
        .bind(timestamp)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Per-chat high-watermark of messages delivered to an agent.
    pub async fn agent_cursor(&self, chat_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT last_timestamp FROM agent_cursors WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.and_then(|r| r.try_get("last_timestamp").ok()))
    }

    /// Advance a chat's agent cursor, monotone like the global one.
    pub async fn advance_agent_cursor(&self, chat_id: &str, timestamp: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_cursors (chat_id, last_timestamp) VALUES (?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET
                last_timestamp = MAX(last_timestamp, excluded.last_timestamp)",
        )
        .bind(chat_id)
        .bind(timestamp)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
