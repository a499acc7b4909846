//! Status relay: turns agent `STATUS:` lines into a single edit-in-place
//! platform message per in-flight batch.

use crate::messenger::Messenger;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(2);

struct StatusEntry {
    chat_id: String,
    last_line: String,
    last_sent: Instant,
    started: bool,
}

/// One relay per process; batches are keyed by correlation id.
pub struct StatusRelay {
    messenger: Arc<dyn Messenger>,
    entries: Mutex<HashMap<String, StatusEntry>>,
    debounce: Duration,
}

impl StatusRelay {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self::with_debounce(messenger, DEFAULT_DEBOUNCE)
    }

    pub fn with_debounce(messenger: Arc<dyn Messenger>, debounce: Duration) -> Self {
        Self {
            messenger,
            entries: Mutex::new(HashMap::new()),
            debounce,
        }
    }

    /// Forward one status line. Identical lines and lines inside the debounce
    /// window of the previous update are coalesced.
    pub async fn update(&self, chat_id: &str, correlation_id: &str, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let is_first;
        {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(correlation_id) {
                Some(entry) => {
                    if entry.last_line == line || entry.last_sent.elapsed() < self.debounce {
                        return;
                    }
                    entry.last_line = line.to_string();
                    entry.last_sent = Instant::now();
                    is_first = false;
                }
                None => {
                    entries.insert(
                        correlation_id.to_string(),
                        StatusEntry {
                            chat_id: chat_id.to_string(),
                            last_line: line.to_string(),
                            last_sent: Instant::now(),
                            started: true,
                        },
                    );
                    is_first = true;
                }
            }
        }

        if let Err(error) = self
            .messenger
            .send_or_update_status(chat_id, correlation_id, &format!("⏳ {line}"), is_first, None)
            .await
        {
            tracing::warn!(%error, chat_id, correlation_id, "failed to relay status line");
        }
    }

    /// End a batch's status: overwrite with a terminal error, or just drop
    /// the tracking so the next batch starts fresh.
    pub async fn finish(&self, chat_id: &str, correlation_id: &str, error: Option<&str>) {
        let tracked = self.entries.lock().await.remove(correlation_id);

        if let (Some(error), Some(entry)) = (error, &tracked) {
            if entry.started {
                if let Err(send_error) = self
                    .messenger
                    .send_or_update_status(
                        &entry.chat_id,
                        correlation_id,
                        &format!("❌ {error}"),
                        false,
                        None,
                    )
                    .await
                {
                    tracing::warn!(%send_error, chat_id, "failed to write terminal status");
                }
            }
        }

        self.messenger.clear_status(chat_id, Some(correlation_id)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::messenger::{CommandSpec, InboundEvent, Messenger};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingMessenger {
        statuses: std::sync::Mutex<Vec<(String, String, String, bool)>>,
        cleared: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        fn name(&self) -> &str {
            "recording"
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn send(&self, _chat_id: &str, _text: &str) -> Result<()> {
            Ok(())
        }
        async fn send_or_update_status(
            &self,
            chat_id: &str,
            correlation_id: &str,
            text: &str,
            is_first: bool,
            _reply_to: Option<&str>,
        ) -> Result<()> {
            self.statuses.lock().unwrap().push((
                chat_id.to_string(),
                correlation_id.to_string(),
                text.to_string(),
                is_first,
            ));
            Ok(())
        }
        async fn clear_status(&self, _chat_id: &str, correlation_id: Option<&str>) {
            if let Some(correlation_id) = correlation_id {
                self.cleared.lock().unwrap().push(correlation_id.to_string());
            }
        }
        async fn register_commands(&self, _commands: &[CommandSpec]) -> Result<()> {
            Ok(())
        }
        async fn start_listener(&self, _tx: mpsc::Sender<InboundEvent>) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn identical_and_rapid_lines_coalesce() {
        let messenger = Arc::new(RecordingMessenger::default());
        let relay = StatusRelay::with_debounce(messenger.clone(), Duration::from_millis(50));

        relay.update("g1", "m1", "reading files").await;
        relay.update("g1", "m1", "reading files").await;
        relay.update("g1", "m1", "still reading").await; // inside the window

        let statuses = messenger.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].2, "⏳ reading files");
        assert!(statuses[0].3);
    }

    #[tokio::test]
    async fn lines_after_the_window_update_in_place() {
        let messenger = Arc::new(RecordingMessenger::default());
        let relay = StatusRelay::with_debounce(messenger.clone(), Duration::from_millis(10));

        relay.update("g1", "m1", "step one").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        relay.update("g1", "m1", "step two").await;

        let statuses = messenger.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(!statuses[1].3, "second update must edit, not create");
    }

    #[tokio::test]
    async fn finish_clears_tracking_and_can_write_terminal_error() {
        let messenger = Arc::new(RecordingMessenger::default());
        let relay = StatusRelay::with_debounce(messenger.clone(), Duration::from_millis(10));

        relay.update("g1", "m1", "working").await;
        relay.finish("g1", "m1", Some("agent timed out")).await;

        {
            let statuses = messenger.statuses.lock().unwrap();
            assert!(statuses.last().unwrap().2.contains("agent timed out"));
            assert_eq!(messenger.cleared.lock().unwrap().as_slice(), ["m1"]);
        }

        // A fresh batch under the same correlation id starts over.
        relay.update("g1", "m1", "round two").await;
        let statuses = messenger.statuses.lock().unwrap();
        assert!(statuses.last().unwrap().3);
    }

    #[tokio::test]
    async fn finish_without_any_status_only_clears() {
        let messenger = Arc::new(RecordingMessenger::default());
        let relay = StatusRelay::with_debounce(messenger.clone(), Duration::from_millis(10));

        relay.finish("g1", "m9", Some("boom")).await;
        assert!(messenger.statuses.lock().unwrap().is_empty());
        assert_eq!(messenger.cleared.lock().unwrap().as_slice(), ["m9"]);
    }
}
