//! Workspace snapshot files the agent reads at a well-known path inside its
//! sandbox: `tasks.json` for every workspace, `available_groups.json` for
//! the main workspace only.

use crate::error::Result;
use crate::store::{ScheduledTask, Store, Workspace};

use anyhow::Context as _;
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Serialize)]
struct TaskSnapshot<'a> {
    id: i64,
    folder: &'a str,
    chat_jid: &'a str,
    prompt: &'a str,
    schedule_type: &'a str,
    schedule_value: &'a str,
    context_mode: &'a str,
    next_run: Option<&'a str>,
    last_run: Option<&'a str>,
    status: &'a str,
}

#[derive(Debug, Serialize)]
struct GroupSnapshot {
    jid: String,
    name: Option<String>,
    kind: String,
    last_message_time: String,
    registered: bool,
}

fn task_view(task: &ScheduledTask) -> TaskSnapshot<'_> {
    TaskSnapshot {
        id: task.id,
        folder: &task.folder,
        chat_jid: &task.chat_id,
        prompt: &task.prompt,
        schedule_type: task.kind.as_str(),
        schedule_value: &task.schedule_value,
        context_mode: task.context_mode.as_str(),
        next_run: task.next_run.as_deref(),
        last_run: task.last_run.as_deref(),
        status: &task.status,
    }
}

/// Write `tasks.json` into the workspace folder. Non-main workspaces see
/// only their own tasks; main sees everything.
pub async fn write_tasks(store: &Store, workspace: &Workspace, dir: &Path) -> Result<()> {
    let filter = (!workspace.is_main).then_some(workspace.folder.as_str());
    let tasks = store.tasks_for_snapshot(filter).await?;
    let views: Vec<TaskSnapshot<'_>> = tasks.iter().map(task_view).collect();

    let json = serde_json::to_string_pretty(&views)?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create workspace dir: {}", dir.display()))?;
    std::fs::write(dir.join("tasks.json"), json)
        .with_context(|| format!("failed to write tasks.json in {}", dir.display()))?;
    Ok(())
}

/// Write `available_groups.json` (main workspace only): every known chat
/// annotated with its registration flag.
pub async fn write_available_groups(store: &Store, dir: &Path) -> Result<()> {
    let chats = store.list_chats_with_registration().await?;
    let views: Vec<GroupSnapshot> = chats
        .into_iter()
        .map(|chat| GroupSnapshot {
            jid: chat.chat_id,
            name: chat.name,
            kind: chat.kind,
            last_message_time: chat.last_message_time,
            registered: chat.registered,
        })
        .collect();

    let json = serde_json::to_string_pretty(&views)?;
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create workspace dir: {}", dir.display()))?;
    std::fs::write(dir.join("available_groups.json"), json).with_context(|| {
        format!("failed to write available_groups.json in {}", dir.display())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;
    use crate::store::{ContextMode, NewTask, ScheduleKind};

    fn workspace(folder: &str, is_main: bool) -> Workspace {
        Workspace {
            chat_id: format!("chat-{folder}"),
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

    fn new_task(folder: &str) -> NewTask {
        NewTask {
            folder: folder.to_string(),
            chat_id: format!("chat-{folder}"),
            prompt: "water the plants".to_string(),
            kind: ScheduleKind::Cron,
            schedule_value: "0 9 * * *".to_string(),
            context_mode: ContextMode::Isolated,
            next_run: Some("2026-01-02T09:00:00.000Z".to_string()),
        }
    }

    #[tokio::test]
    async fn non_main_task_snapshot_is_filtered_to_own_folder() {
        let db = Db::connect_in_memory().await.unwrap();
        let store = Store::new(db.pool.clone());
        store.create_task(&new_task("garden")).await.unwrap();
        store.create_task(&new_task("kitchen")).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        write_tasks(&store, &workspace("garden", false), dir.path())
            .await
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("tasks.json")).unwrap();
        let parsed: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0]["folder"], "garden");
    }

    #[tokio::test]
    async fn main_sees_all_tasks_and_group_listing() {
        let db = Db::connect_in_memory().await.unwrap();
        let store = Store::new(db.pool.clone());
        store.create_task(&new_task("garden")).await.unwrap();
        store.create_task(&new_task("kitchen")).await.unwrap();
        store
            .upsert_chat("g9", Some("Unregistered"), "group", "2026-01-01T00:00:00.000Z")
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        write_tasks(&store, &workspace("main", true), dir.path())
            .await
            .unwrap();
        write_available_groups(&store, dir.path()).await.unwrap();

        let tasks: Vec<serde_json::Value> =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("tasks.json")).unwrap())
                .unwrap();
        assert_eq!(tasks.len(), 2);

        let groups: Vec<serde_json::Value> = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("available_groups.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["registered"], false);
    }
}
