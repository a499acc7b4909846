//! Chat metadata persistence.

use super::Store;
use crate::error::Result;
use sqlx::Row as _;

/// Sentinel chat id recording the last platform-wide chat discovery refresh.
pub const DISCOVERY_SENTINEL: &str = "__discovery__";

/// A known chat annotated with its registration state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatOverview {
    pub chat_id: String,
    pub name: Option<String>,
    pub kind: String,
    pub last_message_time: String,
    pub registered: bool,
}

impl Store {
    /// Upsert chat metadata. The name is upsert-wins-latest (nulls never
    /// overwrite), the activity timestamp is monotonic-max.
    pub async fn upsert_chat(
        &self,
        chat_id: &str,
        name: Option<&str>,
        kind: &str,
        last_message_time: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO chats (chat_id, name, kind, last_message_time)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET
                name = COALESCE(excluded.name, name),
                kind = excluded.kind,
                last_message_time = MAX(last_message_time, excluded.last_message_time)",
        )
        .bind(chat_id)
        .bind(name)
        .bind(kind)
        .bind(last_message_time)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn chat_name(&self, chat_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT name FROM chats WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.and_then(|r| r.try_get("name").ok()))
    }

    pub async fn chat_kind(&self, chat_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT kind FROM chats WHERE chat_id = ?")
            .bind(chat_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.and_then(|r| r.try_get("kind").ok()))
    }

    /// Record when platform-wide chat discovery last ran.
    pub async fn touch_discovery(&self, timestamp: &str) -> Result<()> {
        self.upsert_chat(DISCOVERY_SENTINEL, Some("discovery"), "sentinel", timestamp)
            .await
    }

    pub async fn last_discovery(&self) -> Result<Option<String>> {
        let row = sqlx::query("SELECT last_message_time FROM chats WHERE chat_id = ?")
            .bind(DISCOVERY_SENTINEL)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.and_then(|r| r.try_get("last_message_time").ok()))
    }

    /// All known chats (minus the sentinel) with their registration flag, most
    /// recently active first. Feeds the main workspace's group snapshot.
    pub async fn list_chats_with_registration(&self) -> Result<Vec<ChatOverview>> {
        let rows = sqlx::query(
            "SELECT c.chat_id, c.name, c.kind, c.last_message_time,
                    (w.chat_id IS NOT NULL) AS registered
             FROM chats c
             LEFT JOIN registered_workspaces w ON w.chat_id = c.chat_id
             WHERE c.chat_id <> ?
             ORDER BY c.last_message_time DESC",
        )
        .bind(DISCOVERY_SENTINEL)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ChatOverview {
                chat_id: row.try_get("chat_id").unwrap_or_default(),
                name: row.try_get("name").ok(),
                kind: row.try_get("kind").unwrap_or_default(),
                last_message_time: row.try_get("last_message_time").unwrap_or_default(),
                registered: row.try_get::<bool, _>("registered").unwrap_or(false),
            })
            .collect())
    }
}
