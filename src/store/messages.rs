//! Message persistence. Messages are written once and never updated.

use super::Store;
use crate::error::Result;
use sqlx::Row as _;

/// A persisted chat message.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    pub is_from_me: bool,
}

/// Result of a cross-chat poll: messages past the cursor plus the highest
/// timestamp observed, ready to become the new high-watermark.
#[derive(Debug, Default)]
pub struct NewMessages {
    pub messages: Vec<StoredMessage>,
    pub max_timestamp: Option<String>,
}

fn map_message(row: &sqlx::sqlite::SqliteRow) -> StoredMessage {
    StoredMessage {
        message_id: row.try_get("message_id").unwrap_or_default(),
        chat_id: row.try_get("chat_id").unwrap_or_default(),
        sender_id: row.try_get("sender_id").unwrap_or_default(),
        sender_name: row.try_get("sender_name").unwrap_or_default(),
        content: row.try_get("content").unwrap_or_default(),
        timestamp: row.try_get("timestamp").unwrap_or_default(),
        is_from_me: row.try_get::<i64, _>("is_from_me").unwrap_or(0) != 0,
    }
}

impl Store {
    /// Insert a message, idempotent on the composite primary key.
    pub async fn insert_message(&self, message: &StoredMessage) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO messages
                (message_id, chat_id, sender_id, sender_name, content, timestamp, is_from_me)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.message_id)
        .bind(&message.chat_id)
        .bind(&message.sender_id)
        .bind(&message.sender_name)
        .bind(&message.content)
        .bind(&message.timestamp)
        .bind(message.is_from_me as i64)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Messages for the given chats strictly after `cursor`, excluding the
    /// assistant's own outbound echoes (content starting with `bot_prefix`),
    /// in timestamp order. Also reports the max timestamp observed.
    pub async fn get_new_messages(
        &self,
        chat_ids: &[String],
        cursor: &str,
        bot_prefix: &str,
    ) -> Result<NewMessages> {
        if chat_ids.is_empty() {
            return Ok(NewMessages::default());
        }

        let placeholders = vec!["?"; chat_ids.len()].join(", ");
        let sql = format!(
            "SELECT message_id, chat_id, sender_id, sender_name, content, timestamp, is_from_me
             FROM messages
             WHERE chat_id IN ({placeholders})
               AND timestamp > ?
               AND substr(content, 1, ?) <> ?
             ORDER BY timestamp"
        );

        let mut query = sqlx::query(&sql);
        for chat_id in chat_ids {
            query = query.bind(chat_id);
        }
        let rows = query
            .bind(cursor)
            .bind(bot_prefix.len() as i64)
            .bind(bot_prefix)
            .fetch_all(self.pool())
            .await?;

        let messages: Vec<StoredMessage> = rows.iter().map(map_message).collect();
        let max_timestamp = messages.iter().map(|m| m.timestamp.clone()).max();
        Ok(NewMessages {
            messages,
            max_timestamp,
        })
    }

    /// Same filter as [`Store::get_new_messages`] but scoped to one chat.
    pub async fn get_messages_since(
        &self,
        chat_id: &str,
        cursor: &str,
        bot_prefix: &str,
    ) -> Result<Vec<StoredMessage>> {
        let rows = sqlx::query(
            "SELECT message_id, chat_id, sender_id, sender_name, content, timestamp, is_from_me
             FROM messages
             WHERE chat_id = ?
               AND timestamp > ?
               AND substr(content, 1, ?) <> ?
             ORDER BY timestamp",
        )
        .bind(chat_id)
        .bind(cursor)
        .bind(bot_prefix.len() as i64)
        .bind(bot_prefix)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.iter().map(map_message).collect())
    }
}
