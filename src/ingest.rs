//! Ingestion path: persists chat metadata for every event and full message
//! content for registered chats. Triggering decisions belong to the batch
//! builder, not here.

use crate::error::Result;
use crate::messenger::InboundEvent;
use crate::store::{Store, StoredMessage, WorkspaceRegistry};

/// What the ingest path did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Chat is registered; the message was persisted and the chat has work.
    Stored,
    /// Chat is not registered; only its metadata was recorded.
    MetadataOnly,
    /// Chat is not registered but the event is a slash command. Messages for
    /// unregistered chats are never persisted, so the command layer must see
    /// the event directly — this is the only route by which `/register`
    /// works on a fresh chat.
    UnregisteredCommand,
}

pub async fn record_event(
    store: &Store,
    registry: &WorkspaceRegistry,
    event: &InboundEvent,
) -> Result<IngestOutcome> {
    store
        .upsert_chat(
            &event.chat_id,
            event.chat_name.as_deref(),
            event.chat_kind.as_str(),
            &event.timestamp,
        )
        .await?;

    if !registry.is_registered(&event.chat_id) {
        if event.content.trim_start().starts_with('/') {
            return Ok(IngestOutcome::UnregisteredCommand);
        }
        return Ok(IngestOutcome::MetadataOnly);
    }

    store
        .insert_message(&StoredMessage {
            message_id: event.id.clone(),
            chat_id: event.chat_id.clone(),
            sender_id: event.sender_id.clone(),
            sender_name: event.sender_name.clone(),
            content: event.content.clone(),
            timestamp: event.timestamp.clone(),
            is_from_me: false,
        })
        .await?;

    Ok(IngestOutcome::Stored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::messenger::ChatKind;
    use crate::store::Workspace;

    fn event(chat_id: &str, content: &str) -> InboundEvent {
        InboundEvent {
            id: "m1".to_string(),
            chat_id: chat_id.to_string(),
            sender_id: "u1".to_string(),
            sender_name: "alice".to_string(),
            content: content.to_string(),
            timestamp: "2026-01-01T00:00:01.000Z".to_string(),
            chat_kind: ChatKind::Group,
            chat_name: Some("Garden Club".to_string()),
        }
    }

    async fn registered_setup() -> (Db, Store, WorkspaceRegistry) {
        let db = Db::connect_in_memory().await.unwrap();
        let store = Store::new(db.pool.clone());
        let registry = WorkspaceRegistry::new();
        store
            .register_workspace(&Workspace {
                chat_id: "g1".to_string(),
                name: "Garden Club".to_string(),
                folder: "garden".to_string(),
                trigger_word: String::new(),
                requires_trigger: true,
                is_main: false,
                allowed_users: None,
                added_at: "2026-01-01T00:00:00.000Z".to_string(),
                container: None,
            })
            .await
            .unwrap();
        registry.reload(&store).await.unwrap();
        (db, store, registry)
    }

    #[tokio::test]
    async fn registered_chats_get_full_messages() {
        let (_db, store, registry) = registered_setup().await;

        let outcome = record_event(&store, &registry, &event("g1", "hello"))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Stored);

        let messages = store.get_messages_since("g1", "", "Andy:").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test]
    async fn unregistered_chats_store_metadata_only() {
        let (_db, store, registry) = registered_setup().await;

        let outcome = record_event(&store, &registry, &event("g2", "hello"))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::MetadataOnly);
        assert!(store.get_messages_since("g2", "", "Andy:").await.unwrap().is_empty());
        // Metadata still recorded.
        assert_eq!(
            store.chat_name("g2").await.unwrap().as_deref(),
            Some("Garden Club")
        );
    }

    #[tokio::test]
    async fn unregistered_commands_are_flagged_for_the_command_layer() {
        let (_db, store, registry) = registered_setup().await;

        let outcome = record_event(&store, &registry, &event("g2", "  /register garden2"))
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::UnregisteredCommand);
        assert!(store.get_messages_since("g2", "", "Andy:").await.unwrap().is_empty());
    }
}
