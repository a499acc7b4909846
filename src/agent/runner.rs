//! Agent dispatcher: prepares the workspace, launches the agent container,
//! supervises its stdio, and applies the post-run session/cursor rules.

use crate::agent::container::{
    container_name, ContainerLaunch, ContainerRuntime, MountPolicy,
};
use crate::agent::output::{AgentInput, AgentStatus, OutputKind, OutputScanner, STATUS_PREFIX};
use crate::agent::snapshots;
use crate::config::ContainerConfig;
use crate::error::{Result, RouterError};
use crate::queue::ChatQueue;
use crate::status::StatusRelay;
use crate::store::{Store, Workspace};

use anyhow::Context as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};

/// One batch handed to an agent container.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub chat_id: String,
    pub prompt: String,
    /// First message id of the batch; keys the status message. Scheduled
    /// runs have none.
    pub correlation_id: Option<String>,
    /// Session slot: the workspace folder, or a task-scoped key for isolated
    /// scheduled runs.
    pub session_key: String,
    pub is_scheduled_task: bool,
}

/// What a successful agent run produced.
#[derive(Debug, Clone, Default)]
pub struct AgentRun {
    /// Text to relay to the chat, already stripped of the result envelope.
    pub reply: Option<String>,
    pub new_session_id: Option<String>,
}

pub struct AgentDispatcher {
    container_config: ContainerConfig,
    runtime: Arc<dyn ContainerRuntime>,
    store: Store,
    status: Arc<StatusRelay>,
    queue: Arc<ChatQueue>,
    policy: MountPolicy,
    groups_root: PathBuf,
}

impl AgentDispatcher {
    pub fn new(
        container_config: ContainerConfig,
        runtime: Arc<dyn ContainerRuntime>,
        store: Store,
        status: Arc<StatusRelay>,
        queue: Arc<ChatQueue>,
        policy: MountPolicy,
        groups_root: PathBuf,
    ) -> Self {
        Self {
            container_config,
            runtime,
            store,
            status,
            queue,
            policy,
            groups_root,
        }
    }

    /// Run one batch to completion. Session handles are persisted even when
    /// the run ultimately errors; the caller decides retry policy from the
    /// returned `Result`.
    pub async fn run_batch(&self, workspace: &Workspace, request: &BatchRequest) -> Result<AgentRun> {
        let workspace_dir = self.groups_root.join(&workspace.folder);
        std::fs::create_dir_all(&workspace_dir).with_context(|| {
            format!("failed to create workspace dir: {}", workspace_dir.display())
        })?;

        snapshots::write_tasks(&self.store, workspace, &workspace_dir).await?;
        if workspace.is_main {
            snapshots::write_available_groups(&self.store, &workspace_dir).await?;
        }

        let extra_mounts = workspace
            .container
            .as_ref()
            .map(|c| c.additional_mounts.clone())
            .unwrap_or_default();
        let mounts = self
            .policy
            .resolve(workspace, &workspace_dir, &self.container_config, &extra_mounts);

        let session = self.store.session_for(&request.session_key).await?;
        let input = AgentInput {
            prompt: &request.prompt,
            session_id: session.as_deref(),
            group_folder: &workspace.folder,
            chat_jid: &request.chat_id,
            is_main: workspace.is_main,
            is_scheduled_task: request.is_scheduled_task,
        };
        let input_json = serde_json::to_vec(&input)?;

        let name = container_name();
        let launch = ContainerLaunch {
            name: name.clone(),
            image: self.container_config.image.clone(),
            command: self.container_config.command.clone(),
            mounts,
        };

        tracing::info!(
            chat_id = %request.chat_id,
            folder = %workspace.folder,
            container = %name,
            scheduled = request.is_scheduled_task,
            "launching agent"
        );

        let mut child = self.runtime.launch(&launch).await?;
        self.queue.register_container(&request.chat_id, &name).await;

        let result = self
            .supervise(workspace, request, &name, &mut child, &input_json)
            .await;

        self.queue.clear_container(&request.chat_id, &name).await;

        // An agent may have rotated its session before failing; keep the
        // handle either way.
        if let Ok(run) = &result {
            if let Some(session_id) = &run.new_session_id {
                self.store.store_session(&request.session_key, session_id).await?;
            }
        }

        result
    }

    async fn supervise(
        &self,
        workspace: &Workspace,
        request: &BatchRequest,
        container: &str,
        child: &mut tokio::process::Child,
        input_json: &[u8],
    ) -> Result<AgentRun> {
        // Feed the one-document stdin. A write failure is not fatal on its
        // own: the agent may already be emitting its payload.
        if let Some(mut stdin) = child.stdin.take() {
            let write = async {
                stdin.write_all(input_json).await?;
                stdin.write_all(b"\n").await?;
                stdin.shutdown().await
            };
            if let Err(error) = write.await {
                tracing::debug!(%error, container, "agent stdin write failed");
            }
        }

        // Status lines stream from stderr concurrently with stdout parsing.
        if let Some(stderr) = child.stderr.take() {
            let status = Arc::clone(&self.status);
            let chat_id = request.chat_id.clone();
            let correlation_id = request.correlation_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(rest) = line.strip_prefix(STATUS_PREFIX) {
                        if let Some(correlation_id) = &correlation_id {
                            status.update(&chat_id, correlation_id, rest).await;
                        }
                    } else if !line.trim().is_empty() {
                        tracing::debug!(chat_id = %chat_id, "[agent] {line}");
                    }
                }
            });
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RouterError::Agent("agent stdout not piped".to_string()))?;

        let timeout_secs = workspace
            .container
            .as_ref()
            .and_then(|c| c.timeout_secs)
            .unwrap_or(self.container_config.batch_timeout_secs);

        let mut scanner = OutputScanner::new();
        let consume = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                scanner.feed_line(&line);
            }
            child.wait().await
        };

        let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), consume).await;
        let exit = match outcome {
            Ok(Ok(exit)) => exit,
            Ok(Err(error)) => {
                self.runtime.kill(container).await;
                return Err(RouterError::Agent(format!("agent io failed: {error}")));
            }
            Err(_) => {
                tracing::warn!(container, timeout_secs, "agent exceeded batch timeout");
                self.runtime.kill(container).await;
                let _ = child.start_kill();
                return Err(RouterError::AgentTimeout(timeout_secs));
            }
        };

        let response = scanner.response()?;
        let Some(response) = response else {
            return Err(RouterError::Agent(format!(
                "agent exited ({exit}) without an output payload"
            )));
        };

        let new_session_id = response.new_session_id.clone();

        match response.status {
            AgentStatus::Success => Ok(build_run(response.result, new_session_id)),
            AgentStatus::Error => {
                // A captured result outlives the failure; a bare error does not.
                if response.result.is_some() {
                    tracing::warn!(
                        container,
                        error = %response.error.as_deref().unwrap_or("unknown"),
                        "agent reported an error after emitting a result, keeping the result"
                    );
                    Ok(build_run(response.result, new_session_id))
                } else {
                    // Persist the session before surfacing the failure.
                    if let Some(session_id) = &new_session_id {
                        self.store
                            .store_session(&request.session_key, session_id)
                            .await?;
                    }
                    Err(RouterError::Agent(
                        response.error.unwrap_or_else(|| "agent reported an error".to_string()),
                    ))
                }
            }
        }
    }
}

fn build_run(
    result: Option<crate::agent::output::AgentResult>,
    new_session_id: Option<String>,
) -> AgentRun {
    let reply = result.and_then(|result| match result.output_type {
        OutputKind::Message => result.user_message.filter(|text| !text.is_empty()),
        OutputKind::Log => {
            if let Some(log) = result.internal_log {
                tracing::info!("[agent log] {log}");
            }
            None
        }
    });
    AgentRun {
        reply,
        new_session_id,
    }
}
