//! Per-chat processing: drains staged scheduled tasks, builds message
//! batches, intercepts commands, applies the trigger gate, and dispatches to
//! the agent. Installed into the queue as its `process` callback.

use crate::agent::{AgentDispatcher, BatchRequest};
use crate::batch::{batch_matches_trigger, render_prompt};
use crate::commands::{self, CommandContext};
use crate::config::Config;
use crate::error::Result;
use crate::messenger::{ChatKind, InboundEvent, Messenger};
use crate::queue::ProcessOutcome;
use crate::scheduler::TaskStage;
use crate::status::StatusRelay;
use crate::store::{ScheduledTask, Store, StoredMessage, Workspace, WorkspaceRegistry};

use std::sync::Arc;
use std::time::Instant;

pub struct Router {
    pub config: Config,
    store: Store,
    registry: Arc<WorkspaceRegistry>,
    messenger: Arc<dyn Messenger>,
    dispatcher: AgentDispatcher,
    status: Arc<StatusRelay>,
    stage: TaskStage,
}

impl Router {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: Store,
        registry: Arc<WorkspaceRegistry>,
        messenger: Arc<dyn Messenger>,
        dispatcher: AgentDispatcher,
        status: Arc<StatusRelay>,
        stage: TaskStage,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            messenger,
            dispatcher,
            status,
            stage,
        }
    }

    fn command_context(&self) -> CommandContext<'_> {
        CommandContext {
            config: &self.config,
            store: &self.store,
            registry: self.registry.as_ref(),
        }
    }

    /// Send a chat-visible reply, prefixed so the ingestion filter drops the
    /// echo. Send failures are logged, never fatal.
    async fn reply(&self, chat_id: &str, text: &str) {
        let prefixed = format!("{}: {text}", self.config.assistant_name);
        if let Err(error) = self.messenger.send(chat_id, &prefixed).await {
            tracing::warn!(%error, chat_id, "failed to send reply");
        }
    }

    /// The queue's processing callback for one chat.
    pub async fn process_chat(&self, chat_id: &str) -> ProcessOutcome {
        // Scheduled work staged for this chat runs ahead of message batches,
        // inside the same per-chat serialisation.
        for task in self.stage.drain(chat_id).await {
            self.run_scheduled(&task).await;
        }

        match self.process_messages(chat_id).await {
            Ok(()) => ProcessOutcome::Completed,
            Err(error) => {
                tracing::warn!(%error, chat_id, "batch processing failed");
                ProcessOutcome::Retry
            }
        }
    }

    async fn is_private(&self, chat_id: &str) -> bool {
        matches!(
            self.store.chat_kind(chat_id).await,
            Ok(Some(kind)) if kind == "private"
        )
    }

    async fn process_messages(&self, chat_id: &str) -> Result<()> {
        let Some(workspace) = self.registry.get(chat_id) else {
            return Ok(());
        };

        let cursor = self.store.agent_cursor(chat_id).await?.unwrap_or_default();
        let bot_prefix = self.config.bot_prefix();
        let messages = self
            .store
            .get_messages_since(chat_id, &cursor, &bot_prefix)
            .await?;
        if messages.is_empty() {
            return Ok(());
        }
        let last_timestamp = messages
            .last()
            .map(|m| m.timestamp.clone())
            .unwrap_or_default();

        let is_private = self.is_private(chat_id).await;

        // In-band commands run synchronously and move the cursor past the
        // whole batch.
        if let Some((index, command)) = commands::intercept(&messages) {
            let sender_id = messages[index].sender_id.clone();
            let reply = self
                .command_context()
                .handle(&command, chat_id, &sender_id, is_private)
                .await?;
            self.reply(chat_id, &reply).await;
            self.store
                .advance_agent_cursor(chat_id, &last_timestamp)
                .await?;
            return Ok(());
        }

        // A 1-to-1 chat with an allow-list ignores batches from other
        // senders; they can never become actionable, so the cursor moves on.
        if is_private {
            if let Some(allowed) = &workspace.allowed_users {
                let any_allowed = messages.iter().any(|m| allowed.contains(&m.sender_id));
                if !any_allowed {
                    tracing::debug!(chat_id, "batch from non-allowed senders, skipping");
                    self.store
                        .advance_agent_cursor(chat_id, &last_timestamp)
                        .await?;
                    return Ok(());
                }
            }
        }

        // Trigger gate: success without running keeps the cursor where it
        // was, so a later matching message re-includes this context.
        if !workspace.is_main && !is_private && workspace.requires_trigger {
            let word = if workspace.trigger_word.is_empty() {
                self.config.trigger_pattern.as_str()
            } else {
                workspace.trigger_word.as_str()
            };
            if !batch_matches_trigger(&messages, word) {
                tracing::debug!(chat_id, trigger = word, "no trigger match, holding batch");
                return Ok(());
            }
        }

        self.dispatch_batch(&workspace, &messages, &last_timestamp)
            .await
    }

    async fn dispatch_batch(
        &self,
        workspace: &Workspace,
        messages: &[StoredMessage],
        last_timestamp: &str,
    ) -> Result<()> {
        let chat_id = workspace.chat_id.as_str();
        let correlation_id = messages[0].message_id.clone();

        let request = BatchRequest {
            chat_id: chat_id.to_string(),
            prompt: render_prompt(messages),
            correlation_id: Some(correlation_id.clone()),
            session_key: workspace.folder.clone(),
            is_scheduled_task: false,
        };

        match self.dispatcher.run_batch(workspace, &request).await {
            Ok(run) => {
                if let Some(reply) = &run.reply {
                    self.reply(chat_id, reply).await;
                }
                self.store
                    .advance_agent_cursor(chat_id, last_timestamp)
                    .await?;
                self.status.finish(chat_id, &correlation_id, None).await;
                Ok(())
            }
            Err(error) => {
                self.status
                    .finish(chat_id, &correlation_id, Some(&error.to_string()))
                    .await;
                Err(error)
            }
        }
    }

    /// Execute one staged scheduled task. Failures are recorded in the run
    /// log; schedules re-fire on their own clock, so there is no retry here.
    async fn run_scheduled(&self, task: &ScheduledTask) {
        let Some(workspace) = self
            .registry
            .by_folder(&task.folder)
            .or_else(|| self.registry.get(&task.chat_id))
        else {
            tracing::warn!(task_id = task.id, folder = %task.folder, "task workspace vanished");
            return;
        };

        let session_key = match task.context_mode {
            crate::store::ContextMode::Isolated => format!("task-{}", task.id),
            crate::store::ContextMode::Group => workspace.folder.clone(),
        };

        let request = BatchRequest {
            chat_id: task.chat_id.clone(),
            prompt: task.prompt.clone(),
            correlation_id: None,
            session_key,
            is_scheduled_task: true,
        };

        let run_at = crate::now_timestamp();
        let started = Instant::now();
        let outcome = self.dispatcher.run_batch(&workspace, &request).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let (success, summary) = match outcome {
            Ok(run) => {
                if let Some(reply) = &run.reply {
                    self.reply(&task.chat_id, reply).await;
                }
                (true, run.reply.unwrap_or_else(|| "ok".to_string()))
            }
            Err(error) => {
                tracing::warn!(%error, task_id = task.id, "scheduled task run failed");
                (false, error.to_string())
            }
        };

        if let Err(error) = self
            .store
            .log_task_run(task.id, &run_at, duration_ms, success, Some(&summary))
            .await
        {
            tracing::warn!(%error, task_id = task.id, "failed to write task run log");
        }
        if let Err(error) = self.store.record_task_result(task.id, &summary).await {
            tracing::warn!(%error, task_id = task.id, "failed to record task result");
        }
    }

    /// Slash command from an unregistered chat, routed here directly by the
    /// ingest path (no stored messages exist for it).
    pub async fn handle_unregistered_command(&self, event: &InboundEvent) {
        let Some(command) = commands::parse(&event.content) else {
            return;
        };
        let is_private = event.chat_kind == ChatKind::Private;
        match self
            .command_context()
            .handle(&command, &event.chat_id, &event.sender_id, is_private)
            .await
        {
            Ok(reply) => self.reply(&event.chat_id, &reply).await,
            Err(error) => {
                tracing::warn!(%error, chat_id = %event.chat_id, "command handling failed");
            }
        }
    }
}
