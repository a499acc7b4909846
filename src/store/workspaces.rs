//! Registered workspaces: the per-chat registration records and the
//! in-memory snapshot the hot paths read from.

use super::Store;
use crate::error::{Result, RouterError};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A chat registered to a workspace. The on-disk workspace folder outlives
/// this record.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub chat_id: String,
    pub name: String,
    pub folder: String,
    /// Trigger word for group chats. Empty means the configured global
    /// pattern applies.
    pub trigger_word: String,
    pub requires_trigger: bool,
    pub is_main: bool,
    /// When set on a 1-to-1 chat, only these sender ids may interact.
    pub allowed_users: Option<Vec<String>>,
    pub added_at: String,
    pub container: Option<WorkspaceContainerConfig>,
}

/// Per-workspace container overrides, stored as a JSON column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceContainerConfig {
    #[serde(default)]
    pub additional_mounts: Vec<MountSpec>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    /// Mount name, exposed as `extra/<name>` inside the container.
    pub name: String,
    pub host_path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

fn map_workspace(row: &sqlx::sqlite::SqliteRow) -> Workspace {
    let allowed_users: Option<Vec<String>> = row
        .try_get::<Option<String>, _>("allowed_users")
        .ok()
        .flatten()
        .and_then(|raw| serde_json::from_str(&raw).ok());
    let container: Option<WorkspaceContainerConfig> = row
        .try_get::<Option<String>, _>("container_config")
        .ok()
        .flatten()
        .and_then(|raw| serde_json::from_str(&raw).ok());

    Workspace {
        chat_id: row.try_get("chat_id").unwrap_or_default(),
        name: row.try_get("name").unwrap_or_default(),
        folder: row.try_get("folder").unwrap_or_default(),
        trigger_word: row.try_get("trigger_word").unwrap_or_default(),
        requires_trigger: row.try_get::<i64, _>("requires_trigger").unwrap_or(1) != 0,
        is_main: row.try_get::<i64, _>("is_main").unwrap_or(0) != 0,
        allowed_users,
        added_at: row.try_get("added_at").unwrap_or_default(),
        container,
    }
}

const WORKSPACE_COLUMNS: &str = "chat_id, name, folder, trigger_word, requires_trigger, \
                                 is_main, allowed_users, added_at, container_config";

impl Store {
    /// Persist a registration. Enforces the single-main invariant: a second
    /// main workspace is rejected.
    pub async fn register_workspace(&self, workspace: &Workspace) -> Result<()> {
        if workspace.is_main {
            if let Some(existing) = self.main_workspace().await? {
                if existing.chat_id != workspace.chat_id {
                    return Err(RouterError::Registration(format!(
                        "a main workspace already exists ({})",
                        existing.folder
                    )));
                }
            }
        }

        let allowed_users = workspace
            .allowed_users
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let container = workspace
            .container
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            "INSERT INTO registered_workspaces
                (chat_id, name, folder, trigger_word, requires_trigger, is_main,
                 allowed_users, added_at, container_config)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(chat_id) DO UPDATE SET
                name = excluded.name,
                folder = excluded.folder,
                trigger_word = excluded.trigger_word,
                requires_trigger = excluded.requires_trigger,
                is_main = excluded.is_main,
                allowed_users = excluded.allowed_users,
                container_config = excluded.container_config",
        )
        .bind(&workspace.chat_id)
        .bind(&workspace.name)
        .bind(&workspace.folder)
        .bind(&workspace.trigger_word)
        .bind(workspace.requires_trigger as i64)
        .bind(workspace.is_main as i64)
        .bind(allowed_users)
        .bind(&workspace.added_at)
        .bind(container)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn workspace_for_chat(&self, chat_id: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM registered_workspaces WHERE chat_id = ?"
        ))
        .bind(chat_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.as_ref().map(map_workspace))
    }

    pub async fn workspace_by_folder(&self, folder: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM registered_workspaces WHERE folder = ?"
        ))
        .bind(folder)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.as_ref().map(map_workspace))
    }

    pub async fn main_workspace(&self) -> Result<Option<Workspace>> {
        let row = sqlx::query(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM registered_workspaces WHERE is_main = 1"
        ))
        .fetch_optional(self.pool())
        .await?;
        Ok(row.as_ref().map(map_workspace))
    }

    pub async fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKSPACE_COLUMNS} FROM registered_workspaces ORDER BY added_at"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(rows.iter().map(map_workspace).collect())
    }
}

/// Hot-reloadable snapshot of the registration table.
///
/// The listener, queue processor and IPC watcher all consult registrations on
/// every event; they read a lock-free snapshot that is swapped wholesale
/// whenever the table changes.
pub struct WorkspaceRegistry {
    by_chat: ArcSwap<HashMap<String, Workspace>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self {
            by_chat: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Rebuild the snapshot from the store.
    pub async fn reload(&self, store: &Store) -> Result<()> {
        let workspaces = store.list_workspaces().await?;
        let map: HashMap<String, Workspace> = workspaces
            .into_iter()
            .map(|w| (w.chat_id.clone(), w))
            .collect();
        self.by_chat.store(Arc::new(map));
        Ok(())
    }

    pub fn get(&self, chat_id: &str) -> Option<Workspace> {
        self.by_chat.load().get(chat_id).cloned()
    }

    pub fn by_folder(&self, folder: &str) -> Option<Workspace> {
        self.by_chat
            .load()
            .values()
            .find(|w| w.folder == folder)
            .cloned()
    }

    pub fn main(&self) -> Option<Workspace> {
        self.by_chat.load().values().find(|w| w.is_main).cloned()
    }

    pub fn is_registered(&self, chat_id: &str) -> bool {
        self.by_chat.load().contains_key(chat_id)
    }

    pub fn chat_ids(&self) -> Vec<String> {
        self.by_chat.load().keys().cloned().collect()
    }
}

impl Default for WorkspaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn workspace(chat_id: &str, folder: &str, is_main: bool) -> Workspace {
        Workspace {
            chat_id: chat_id.to_string(),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger_word: String::new(),
            requires_trigger: true,
            is_main,
            allowed_users: None,
            added_at: "2026-01-01T00:00:00.000Z".to_string(),
            container: None,
        }
    }

    #[tokio::test]
    async fn second_main_workspace_is_rejected() {
        let db = Db::connect_in_memory().await.unwrap();
        let store = Store::new(db.pool.clone());

        store
            .register_workspace(&workspace("p1", "main", true))
            .await
            .unwrap();
        let err = store
            .register_workspace(&workspace("p2", "other", true))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Registration(_)));

        let main = store.main_workspace().await.unwrap().unwrap();
        assert_eq!(main.chat_id, "p1");
    }

    #[tokio::test]
    async fn container_config_roundtrips_through_json_column() {
        let db = Db::connect_in_memory().await.unwrap();
        let store = Store::new(db.pool.clone());

        let mut ws = workspace("g1", "garden", false);
        ws.allowed_users = Some(vec!["u1".to_string()]);
        ws.container = Some(WorkspaceContainerConfig {
            additional_mounts: vec![MountSpec {
                name: "notes".to_string(),
                host_path: PathBuf::from("/srv/shared/notes"),
                read_only: false,
            }],
            timeout_secs: Some(60),
        });
        store.register_workspace(&ws).await.unwrap();

        let got = store.workspace_for_chat("g1").await.unwrap().unwrap();
        assert_eq!(got.allowed_users.as_deref(), Some(&["u1".to_string()][..]));
        let container = got.container.unwrap();
        assert_eq!(container.timeout_secs, Some(60));
        assert_eq!(container.additional_mounts[0].name, "notes");
    }

    #[tokio::test]
    async fn registry_snapshot_reflects_reload() {
        let db = Db::connect_in_memory().await.unwrap();
        let store = Store::new(db.pool.clone());
        let registry = WorkspaceRegistry::new();

        assert!(!registry.is_registered("g1"));
        store
            .register_workspace(&workspace("g1", "garden", false))
            .await
            .unwrap();
        registry.reload(&store).await.unwrap();

        assert!(registry.is_registered("g1"));
        assert_eq!(registry.by_folder("garden").unwrap().chat_id, "g1");
        assert!(registry.main().is_none());
    }
}
