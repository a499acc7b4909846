//! Filesystem IPC between running agents and the router.
//!
//! Layout: `<root>/<workspace_folder>/{messages,tasks}/*.json`. The directory
//! a file sits in *is* its claim of origin — the directory name is trusted,
//! the file contents are not. Unparseable or failing records are quarantined
//! under `<root>/errors/`; enacted and denied records are deleted.

use crate::agent::snapshots;
use crate::commands::ensure_workspace_dir;
use crate::config::Config;
use crate::error::{Result, RouterError};
use crate::messenger::Messenger;
use crate::scheduler::initial_next_run;
use crate::store::{
    ContextMode, NewTask, ScheduleKind, Store, TaskStatus, Workspace, WorkspaceContainerConfig,
    WorkspaceRegistry,
};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A record dropped by an agent into its workspace IPC directory.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRecord {
    Message {
        chat_jid: String,
        text: String,
    },
    Status {
        chat_jid: String,
        text: String,
    },
    ScheduleTask {
        prompt: String,
        schedule_type: String,
        schedule_value: String,
        target_jid: String,
        #[serde(default)]
        context_mode: Option<String>,
    },
    PauseTask {
        task_id: i64,
    },
    ResumeTask {
        task_id: i64,
    },
    CancelTask {
        task_id: i64,
    },
    RefreshGroups,
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        #[serde(default)]
        trigger: String,
        #[serde(default)]
        container_config: Option<WorkspaceContainerConfig>,
    },
}

/// What happened to one record.
enum Disposition {
    /// Enacted; delete the file.
    Enacted,
    /// Authorisation failure; warn and drop the file.
    Denied(String),
}

pub struct IpcWatcher {
    config: Config,
    store: Store,
    registry: Arc<WorkspaceRegistry>,
    messenger: Arc<dyn Messenger>,
    cancel: CancellationToken,
}

impl IpcWatcher {
    pub fn new(
        config: Config,
        store: Store,
        registry: Arc<WorkspaceRegistry>,
        messenger: Arc<dyn Messenger>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            messenger,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let interval = std::time::Duration::from_millis(self.config.ipc_poll_interval_ms.max(50));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        tracing::info!("IPC watcher shutting down");
                        break;
                    }
                    _ = ticker.tick() => {}
                }
                if let Err(error) = self.scan_once().await {
                    tracing::warn!(%error, "IPC scan failed");
                }
            }
        })
    }

    /// One sweep over every workspace's `messages/` and `tasks/` directories.
    pub async fn scan_once(&self) -> Result<()> {
        let root = self.config.ipc_root();
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let origin = entry.file_name().to_string_lossy().to_string();
            if origin == "errors" {
                continue;
            }
            for subdir in ["messages", "tasks"] {
                self.drain_dir(&origin, &entry.path().join(subdir)).await;
            }
        }
        Ok(())
    }

    async fn drain_dir(&self, origin: &str, dir: &Path) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        let mut files: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
            .collect();
        files.sort();

        for path in files {
            match self.handle_file(origin, &path).await {
                Ok(Disposition::Enacted) => {
                    if let Err(error) = std::fs::remove_file(&path) {
                        tracing::warn!(%error, path = %path.display(), "failed to delete IPC file");
                    }
                }
                Ok(Disposition::Denied(reason)) => {
                    tracing::warn!(
                        origin,
                        path = %path.display(),
                        %reason,
                        "dropping unauthorized IPC record"
                    );
                    if let Err(error) = std::fs::remove_file(&path) {
                        tracing::warn!(%error, path = %path.display(), "failed to drop IPC file");
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        %error,
                        origin,
                        path = %path.display(),
                        "quarantining failing IPC record"
                    );
                    self.quarantine(origin, &path);
                }
            }
        }
    }

    fn quarantine(&self, origin: &str, path: &Path) {
        let errors_dir = self.config.ipc_root().join("errors");
        if let Err(error) = std::fs::create_dir_all(&errors_dir) {
            tracing::warn!(%error, "failed to create IPC errors dir");
            return;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "record.json".to_string());
        let target = errors_dir.join(format!("{origin}-{file_name}"));
        if let Err(error) = std::fs::rename(path, &target) {
            tracing::warn!(%error, path = %path.display(), "failed to quarantine IPC file");
        }
    }

    async fn handle_file(&self, origin: &str, path: &Path) -> Result<Disposition> {
        let raw = std::fs::read_to_string(path)?;
        let record: IpcRecord = serde_json::from_str(&raw)?;
        self.enact(origin, record).await
    }

    fn origin_is_main(&self, origin: &str) -> bool {
        self.registry
            .main()
            .map(|main| main.folder == origin)
            .unwrap_or(false)
    }

    /// Apply the authorisation matrix and enact one record.
    async fn enact(&self, origin: &str, record: IpcRecord) -> Result<Disposition> {
        let is_main = self.origin_is_main(origin);

        match record {
            IpcRecord::Message { chat_jid, text } => {
                if let Some(denied) = self.deny_chat_target(origin, is_main, &chat_jid) {
                    return Ok(denied);
                }
                let prefixed = format!("{}: {text}", self.config.assistant_name);
                if let Err(error) = self.messenger.send(&chat_jid, &prefixed).await {
                    tracing::warn!(%error, %chat_jid, "IPC message send failed");
                }
                Ok(Disposition::Enacted)
            }
            IpcRecord::Status { chat_jid, text } => {
                if let Some(denied) = self.deny_chat_target(origin, is_main, &chat_jid) {
                    return Ok(denied);
                }
                if let Err(error) = self.messenger.send(&chat_jid, &format!("⏳ {text}")).await {
                    tracing::warn!(%error, %chat_jid, "IPC status send failed");
                }
                Ok(Disposition::Enacted)
            }
            IpcRecord::ScheduleTask {
                prompt,
                schedule_type,
                schedule_value,
                target_jid,
                context_mode,
            } => {
                let Some(target) = self.registry.get(&target_jid) else {
                    return Ok(Disposition::Denied(format!(
                        "schedule_task target {target_jid} is not registered"
                    )));
                };
                if !is_main && target.folder != origin {
                    return Ok(Disposition::Denied(format!(
                        "schedule_task for foreign workspace {}",
                        target.folder
                    )));
                }

                let kind = ScheduleKind::parse(&schedule_type)?;
                let next_run =
                    initial_next_run(kind, &schedule_value, self.config.tz(), chrono::Utc::now())?;
                let task_id = self
                    .store
                    .create_task(&NewTask {
                        folder: target.folder.clone(),
                        chat_id: target_jid,
                        prompt,
                        kind,
                        schedule_value,
                        context_mode: context_mode
                            .as_deref()
                            .map(ContextMode::parse)
                            .unwrap_or_default(),
                        next_run,
                    })
                    .await?;
                tracing::info!(task_id, origin, "scheduled task created via IPC");
                Ok(Disposition::Enacted)
            }
            IpcRecord::PauseTask { task_id } => {
                self.mutate_task(origin, is_main, task_id, TaskStatus::Paused)
                    .await
            }
            IpcRecord::ResumeTask { task_id } => {
                self.mutate_task(origin, is_main, task_id, TaskStatus::Active)
                    .await
            }
            IpcRecord::CancelTask { task_id } => {
                let Some(task) = self.store.get_task(task_id).await? else {
                    return Ok(Disposition::Denied(format!("no such task {task_id}")));
                };
                if !is_main && task.folder != origin {
                    return Ok(Disposition::Denied(format!(
                        "cancel_task for foreign workspace {}",
                        task.folder
                    )));
                }
                self.store.cancel_task(task_id).await?;
                tracing::info!(task_id, origin, "task cancelled via IPC");
                Ok(Disposition::Enacted)
            }
            IpcRecord::RefreshGroups => {
                if !is_main {
                    return Ok(Disposition::Denied("refresh_groups is main-only".to_string()));
                }
                self.store.touch_discovery(&crate::now_timestamp()).await?;
                if let Some(main) = self.registry.main() {
                    let dir = self.config.groups_root().join(&main.folder);
                    snapshots::write_available_groups(&self.store, &dir).await?;
                }
                tracing::info!(origin, "group discovery refreshed via IPC");
                Ok(Disposition::Enacted)
            }
            IpcRecord::RegisterGroup {
                jid,
                name,
                folder,
                trigger,
                container_config,
            } => {
                if !is_main {
                    return Ok(Disposition::Denied("register_group is main-only".to_string()));
                }
                let folder = crate::commands::sanitize_folder(&folder);
                if folder.is_empty() {
                    return Err(RouterError::Registration(
                        "register_group folder sanitised to empty".to_string(),
                    ));
                }
                let workspace = Workspace {
                    chat_id: jid.clone(),
                    name,
                    folder: folder.clone(),
                    trigger_word: trigger,
                    requires_trigger: true,
                    is_main: false,
                    allowed_users: None,
                    added_at: crate::now_timestamp(),
                    container: container_config,
                };
                self.store.register_workspace(&workspace).await?;
                self.registry.reload(&self.store).await?;
                ensure_workspace_dir(&self.config.groups_root(), &folder);
                tracing::info!(jid = %jid, folder = %folder, "chat registered via IPC");
                Ok(Disposition::Enacted)
            }
        }
    }

    /// `message`/`status` target rule: main may address any registered chat;
    /// a non-main workspace only chats registered to its own folder.
    fn deny_chat_target(
        &self,
        origin: &str,
        is_main: bool,
        chat_jid: &str,
    ) -> Option<Disposition> {
        let Some(target) = self.registry.get(chat_jid) else {
            return Some(Disposition::Denied(format!(
                "target chat {chat_jid} is not registered"
            )));
        };
        if !is_main && target.folder != origin {
            return Some(Disposition::Denied(format!(
                "message for foreign workspace {}",
                target.folder
            )));
        }
        None
    }

    async fn mutate_task(
        &self,
        origin: &str,
        is_main: bool,
        task_id: i64,
        status: TaskStatus,
    ) -> Result<Disposition> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(Disposition::Denied(format!("no such task {task_id}")));
        };
        if !is_main && task.folder != origin {
            return Ok(Disposition::Denied(format!(
                "task mutation for foreign workspace {}",
                task.folder
            )));
        }
        self.store.set_task_status(task_id, status).await?;
        tracing::info!(task_id, origin, status = status.as_str(), "task status changed via IPC");
        Ok(Disposition::Enacted)
    }
}
