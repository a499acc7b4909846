//! Process lifecycle: boot order, recovery scan, signal handling, shutdown.

use crate::agent::{AgentDispatcher, CliRuntime, ContainerRuntime, MountPolicy};
use crate::commands;
use crate::config::{Config, MessengerKind};
use crate::db::Db;
use crate::error::{Result, RouterError};
use crate::ingest::{self, IngestOutcome};
use crate::ipc::IpcWatcher;
use crate::messenger::{polling::BotApiMessenger, socket::EventSocketMessenger, Messenger};
use crate::queue::ChatQueue;
use crate::router::Router;
use crate::scheduler::{Scheduler, TaskStage};
use crate::status::StatusRelay;
use crate::store::{Store, WorkspaceRegistry};

use anyhow::Context as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Initialise tracing. With a log directory, output also goes to a daily
/// rolling file (the non-blocking guard is leaked for process lifetime).
pub fn init_tracing(debug: bool, log_dir: Option<&std::path::Path>) {
    let filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    let fmt_layer = tracing_subscriber::fmt::layer().compact();

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "nanoclaw.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            std::mem::forget(guard);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .compact();
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .with(file_layer)
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .init();
        }
    }
}

/// Build the configured messenger adapter.
pub fn build_messenger(config: &Config) -> Result<Arc<dyn Messenger>> {
    match config.messenger.kind {
        MessengerKind::Polling => {
            let api_url = config
                .messenger
                .api_url
                .as_deref()
                .ok_or_else(|| RouterError::Messenger("messenger.api_url not set".to_string()))?;
            let base = match &config.messenger.token_file {
                Some(token_file) => {
                    let token = std::fs::read_to_string(token_file)
                        .with_context(|| {
                            format!("failed to read token file: {}", token_file.display())
                        })?
                        .trim()
                        .to_string();
                    if token.is_empty() {
                        return Err(RouterError::Messenger(format!(
                            "token file is empty: {}",
                            token_file.display()
                        )));
                    }
                    format!("{api_url}{token}")
                }
                None => api_url.to_string(),
            };
            let interval = Duration::from_millis(config.poll_interval_ms.max(100));
            Ok(Arc::new(BotApiMessenger::new(&base, interval)?))
        }
        MessengerKind::Socket => {
            let url = config.messenger.socket_url.as_deref().ok_or_else(|| {
                RouterError::Messenger("messenger.socket_url not set".to_string())
            })?;
            Ok(Arc::new(EventSocketMessenger::new(url)))
        }
    }
}

/// Enqueue every registered chat that still has unprocessed messages beyond
/// its agent cursor. Runs once at startup so work interrupted by a crash is
/// picked up again.
async fn recovery_scan(
    store: &Store,
    registry: &WorkspaceRegistry,
    queue: &Arc<ChatQueue>,
    bot_prefix: &str,
) -> Result<usize> {
    let mut recovered = 0;
    for chat_id in registry.chat_ids() {
        let cursor = store.agent_cursor(&chat_id).await?.unwrap_or_default();
        let pending = store
            .get_messages_since(&chat_id, &cursor, bot_prefix)
            .await?;
        if !pending.is_empty() {
            tracing::info!(%chat_id, pending = pending.len(), "recovering undelivered batch");
            queue.enqueue(&chat_id).await;
            recovered += 1;
        }
    }
    Ok(recovered)
}

/// Tail the store for messengers whose events are persisted out-of-band:
/// advance the global cursor and enqueue chats with fresh messages.
fn spawn_ingestion_tail(
    store: Store,
    registry: Arc<WorkspaceRegistry>,
    queue: Arc<ChatQueue>,
    bot_prefix: String,
    interval: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let chat_ids = registry.chat_ids();
            if chat_ids.is_empty() {
                continue;
            }
            let cursor = match store.last_timestamp().await {
                Ok(cursor) => cursor.unwrap_or_default(),
                Err(error) => {
                    tracing::warn!(%error, "failed to read ingestion cursor");
                    continue;
                }
            };
            let new = match store.get_new_messages(&chat_ids, &cursor, &bot_prefix).await {
                Ok(new) => new,
                Err(error) => {
                    tracing::warn!(%error, "store tail query failed");
                    continue;
                }
            };

            // The global cursor advances before per-chat processing; per-chat
            // cursors only move on agent success.
            if let Some(max) = &new.max_timestamp {
                if let Err(error) = store.advance_last_timestamp(max).await {
                    tracing::error!(%error, "failed to persist ingestion cursor");
                    continue;
                }
            }

            let mut chats: Vec<String> = new.messages.into_iter().map(|m| m.chat_id).collect();
            chats.sort();
            chats.dedup();
            for chat_id in chats {
                queue.enqueue(&chat_id).await;
            }
        }
    })
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Boot the runtime and block until a shutdown signal drains it.
pub async fn run(config: Config) -> Result<()> {
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(CliRuntime::new(&config.container.engine));
    let messenger = build_messenger(&config)?;
    run_with(config, messenger, runtime).await
}

/// `run` with injected collaborators; the seam tests and embedders use.
pub async fn run_with(
    config: Config,
    messenger: Arc<dyn Messenger>,
    runtime: Arc<dyn ContainerRuntime>,
) -> Result<()> {
    // A dead container engine means no batch can ever run; fail fast with an
    // operator-facing message.
    runtime.ensure_available().await?;

    let db = Db::connect(&config.data_dir).await?;
    let store = Store::new(db.pool.clone());
    let registry = Arc::new(WorkspaceRegistry::new());
    registry.reload(&store).await?;

    messenger.connect().await?;
    if let Err(error) = messenger.register_commands(commands::CATALOG).await {
        tracing::warn!(%error, "platform command registration failed");
    }

    let cancel = CancellationToken::new();
    let status = Arc::new(StatusRelay::new(messenger.clone()));
    let queue = ChatQueue::new(config.queue.clone(), runtime.clone());
    let policy = MountPolicy::load(&config.mount_allowlist_file);
    let stage = TaskStage::new();

    let dispatcher = AgentDispatcher::new(
        config.container.clone(),
        runtime.clone(),
        store.clone(),
        status.clone(),
        queue.clone(),
        policy,
        config.groups_root(),
    );
    let router = Arc::new(Router::new(
        config.clone(),
        store.clone(),
        registry.clone(),
        messenger.clone(),
        dispatcher,
        status.clone(),
        stage.clone(),
    ));

    {
        let router = router.clone();
        queue
            .set_processor(Arc::new(move |chat_id: String| {
                let router = router.clone();
                Box::pin(async move { router.process_chat(&chat_id).await })
            }))
            .await;
    }

    let _ipc = IpcWatcher::new(
        config.clone(),
        store.clone(),
        registry.clone(),
        messenger.clone(),
        cancel.child_token(),
    )
    .spawn();

    let _scheduler = Scheduler::new(
        store.clone(),
        queue.clone(),
        stage.clone(),
        config.tz(),
        Duration::from_secs(config.scheduler_interval_secs.max(1)),
        cancel.child_token(),
    )
    .spawn();

    let recovered = recovery_scan(&store, &registry, &queue, &config.bot_prefix()).await?;
    if recovered > 0 {
        tracing::info!(recovered, "recovery scan enqueued chats");
    }

    // Inbound pipeline: every event goes through ingest; push messengers
    // enqueue directly, polling messengers rely on the store tail below.
    let (inbound_tx, mut inbound_rx) = mpsc::channel(256);
    messenger.start_listener(inbound_tx).await?;
    let needs_polling = messenger.needs_polling();
    let pump = {
        let store = store.clone();
        let registry = registry.clone();
        let queue = queue.clone();
        let router = router.clone();
        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                match ingest::record_event(&store, &registry, &event).await {
                    Ok(IngestOutcome::Stored) => {
                        if !needs_polling {
                            queue.enqueue(&event.chat_id).await;
                        }
                    }
                    Ok(IngestOutcome::UnregisteredCommand) => {
                        router.handle_unregistered_command(&event).await;
                    }
                    Ok(IngestOutcome::MetadataOnly) => {}
                    Err(error) => {
                        tracing::warn!(%error, chat_id = %event.chat_id, "ingest failed");
                    }
                }
            }
        })
    };

    if needs_polling {
        let _tail = spawn_ingestion_tail(
            store.clone(),
            registry.clone(),
            queue.clone(),
            config.bot_prefix(),
            messenger.poll_interval(),
            cancel.child_token(),
        );
    }

    if let Some(main) = registry.main() {
        let greeting = format!("{}: back online.", config.assistant_name);
        if let Err(error) = messenger.send(&main.chat_id, &greeting).await {
            tracing::warn!(%error, "failed to send startup greeting");
        }
    }

    tracing::info!(
        messenger = messenger.name(),
        workspaces = registry.chat_ids().len(),
        "nanoclaw is up"
    );

    shutdown_signal().await;
    tracing::info!("shutdown signal received, draining queue");

    cancel.cancel();
    queue.shutdown(SHUTDOWN_DEADLINE).await;
    pump.abort();
    db.close().await;

    tracing::info!("shutdown complete");
    Ok(())
}
