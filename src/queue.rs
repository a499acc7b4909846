//! Per-chat work queue: strict serialisation within a chat, bounded
//! parallelism across chats, retry with capped backoff, and shutdown that
//! terminates in-flight agent containers.

use crate::agent::container::ContainerRuntime;
use crate::config::QueueConfig;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Result of one processing pass over a chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Work done (or nothing to do). Retry counter resets.
    Completed,
    /// Transient failure; re-run after backoff.
    Retry,
}

/// The injected per-chat processing function. Installed after construction
/// to break the router ↔ queue cycle.
pub type Processor = Arc<dyn Fn(String) -> BoxFuture<'static, ProcessOutcome> + Send + Sync>;

#[derive(Default)]
struct ChatEntry {
    /// Set when messages arrive while the processor is running; forces an
    /// immediate re-run on completion.
    dirty: bool,
    running: bool,
    attempts: u32,
}

pub struct ChatQueue {
    config: QueueConfig,
    runtime: Arc<dyn ContainerRuntime>,
    entries: Mutex<HashMap<String, ChatEntry>>,
    processor: Mutex<Option<Processor>>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    closed: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Active container names per chat, for cancellation at shutdown.
    containers: Mutex<HashMap<String, Vec<String>>>,
}

impl ChatQueue {
    pub fn new(config: QueueConfig, runtime: Arc<dyn ContainerRuntime>) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.max_parallel_chats.max(1)));
        Arc::new(Self {
            config,
            runtime,
            entries: Mutex::new(HashMap::new()),
            processor: Mutex::new(None),
            permits,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            containers: Mutex::new(HashMap::new()),
        })
    }

    /// Install the processing callback. Must happen before the first enqueue.
    pub async fn set_processor(&self, processor: Processor) {
        *self.processor.lock().await = Some(processor);
    }

    /// Token cancelled when the queue shuts down. Long-running processors may
    /// watch it to bail out early.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Schedule a chat for processing. Idempotent: while the chat is already
    /// scheduled the call collapses; while it is running the dirty bit makes
    /// the worker go one more round.
    pub async fn enqueue(self: &Arc<Self>, chat_id: &str) {
        if self.closed.load(Ordering::SeqCst) {
            tracing::debug!(chat_id, "queue closed, dropping enqueue");
            return;
        }

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(chat_id) {
            if entry.running {
                entry.dirty = true;
            }
            return;
        }
        entries.insert(chat_id.to_string(), ChatEntry::default());
        drop(entries);

        let queue = Arc::clone(self);
        let chat_id = chat_id.to_string();
        let handle = tokio::spawn(async move {
            queue.drive(chat_id).await;
        });
        let mut workers = self.workers.lock().await;
        workers.retain(|worker| !worker.is_finished());
        workers.push(handle);
    }

    /// Worker loop for one chat. Runs the processor until it completes with a
    /// clean dirty bit, retries with backoff, or the queue closes.
    async fn drive(self: Arc<Self>, chat_id: String) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let Some(processor) = self.processor.lock().await.clone() else {
                tracing::error!(%chat_id, "no processor installed, dropping work");
                break;
            };

            let permit = tokio::select! {
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.cancel.cancelled() => break,
            };

            {
                let mut entries = self.entries.lock().await;
                if let Some(entry) = entries.get_mut(&chat_id) {
                    entry.running = true;
                    entry.dirty = false;
                }
            }

            let outcome = processor(chat_id.clone()).await;
            drop(permit);

            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get_mut(&chat_id) else {
                break;
            };
            entry.running = false;

            match outcome {
                ProcessOutcome::Completed => {
                    entry.attempts = 0;
                    if entry.dirty {
                        // Messages arrived mid-run; go again immediately.
                        continue;
                    }
                    entries.remove(&chat_id);
                    break;
                }
                ProcessOutcome::Retry => {
                    entry.attempts += 1;
                    let attempts = entry.attempts;
                    if attempts >= self.config.max_attempts {
                        tracing::error!(
                            %chat_id,
                            attempts,
                            "giving up on chat after repeated failures"
                        );
                        entries.remove(&chat_id);
                        break;
                    }
                    drop(entries);

                    let delay = self.backoff(attempts);
                    tracing::warn!(%chat_id, attempts, ?delay, "batch failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
            }
        }
    }

    /// Deterministic capped exponential backoff.
    fn backoff(&self, attempts: u32) -> Duration {
        let exp = self
            .config
            .retry_base_ms
            .saturating_mul(1u64 << attempts.min(16).saturating_sub(1));
        Duration::from_millis(exp.min(self.config.retry_cap_ms))
    }

    /// Record an in-flight container so shutdown can terminate it.
    pub async fn register_container(&self, chat_id: &str, container_name: &str) {
        self.containers
            .lock()
            .await
            .entry(chat_id.to_string())
            .or_default()
            .push(container_name.to_string());
    }

    pub async fn clear_container(&self, chat_id: &str, container_name: &str) {
        let mut containers = self.containers.lock().await;
        if let Some(names) = containers.get_mut(chat_id) {
            names.retain(|name| name != container_name);
            if names.is_empty() {
                containers.remove(chat_id);
            }
        }
    }

    /// Close the queue: stop accepting work, signal in-flight containers to
    /// terminate, and escalate to a hard kill at the deadline.
    pub async fn shutdown(&self, deadline: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        self.cancel.cancel();

        let names: Vec<String> = self
            .containers
            .lock()
            .await
            .values()
            .flatten()
            .cloned()
            .collect();
        for name in &names {
            self.runtime.terminate(name).await;
        }

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().await);
        let drain = async {
            for handle in handles {
                if let Err(error) = handle.await {
                    tracing::warn!(%error, "queue worker join failed");
                }
            }
        };

        if tokio::time::timeout(deadline, drain).await.is_err() {
            tracing::warn!("queue drain exceeded deadline, killing remaining containers");
            let remaining: Vec<String> = self
                .containers
                .lock()
                .await
                .values()
                .flatten()
                .cloned()
                .collect();
            for name in &remaining {
                self.runtime.kill(name).await;
            }
        }
    }
}
