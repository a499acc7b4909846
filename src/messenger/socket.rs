//! Push-based messenger: consumes a WebSocket event bus.
//!
//! Inbound envelopes are JSON text frames. Redeliveries after a reconnect are
//! suppressed by the seen-id cache; the composite message key in the store
//! absorbs anything the cache misses across restarts.

use crate::error::{Result, RouterError};
use crate::messenger::dedup::SeenCache;
use crate::messenger::{media_placeholder, ChatKind, InboundEvent, Messenger};

use async_trait::async_trait;
use futures_util::{SinkExt as _, StreamExt as _};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

const SEEN_CACHE_CAPACITY: usize = 1_000;
const SEEN_CACHE_TTL: Duration = Duration::from_secs(600);
const RECONNECT_BASE_MS: u64 = 500;
const RECONNECT_CAP_MS: u64 = 30_000;

/// WebSocket event-bus messenger.
pub struct EventSocketMessenger {
    url: String,
    outbound_tx: Mutex<Option<mpsc::Sender<OutboundFrame>>>,
    /// Correlation ids with an allocated status message, plus accumulated text.
    statuses: Mutex<HashMap<String, StatusState>>,
}

struct StatusState {
    chat_id: String,
    text: String,
}

/// Inbound bus envelope.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Message {
        id: String,
        chat_jid: String,
        sender: String,
        sender_name: Option<String>,
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        media_kind: Option<String>,
        #[serde(default)]
        caption: Option<String>,
        timestamp: Option<String>,
        #[serde(default)]
        chat_type: Option<String>,
        #[serde(default)]
        chat_name: Option<String>,
    },
    #[serde(other)]
    Ignored,
}

/// Outbound bus envelope. Status messages are addressed by a client
/// reference so edits replace the earlier frame server-side.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame {
    Send {
        chat_jid: String,
        text: String,
    },
    Edit {
        chat_jid: String,
        client_ref: String,
        text: String,
    },
}

impl EventSocketMessenger {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            outbound_tx: Mutex::new(None),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    async fn enqueue(&self, frame: OutboundFrame) -> Result<()> {
        let guard = self.outbound_tx.lock().await;
        let tx = guard
            .as_ref()
            .ok_or_else(|| RouterError::Messenger("socket not connected".to_string()))?;
        tx.send(frame)
            .await
            .map_err(|_| RouterError::Messenger("socket writer closed".to_string()))
    }
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exp = RECONNECT_BASE_MS.saturating_mul(1u64 << attempt.min(10).saturating_sub(1));
    Duration::from_millis(exp.min(RECONNECT_CAP_MS))
}

fn normalize_frame(frame: InboundFrame) -> Option<InboundEvent> {
    let InboundFrame::Message {
        id,
        chat_jid,
        sender,
        sender_name,
        text,
        media_kind,
        caption,
        timestamp,
        chat_type,
        chat_name,
    } = frame
    else {
        return None;
    };

    let content = match (text, media_kind) {
        (Some(text), _) if !text.is_empty() => text,
        (_, Some(kind)) => media_placeholder(&kind, caption.as_deref()),
        _ => return None,
    };

    let chat_kind = match chat_type.as_deref() {
        Some("private") => ChatKind::Private,
        _ => ChatKind::Group,
    };

    Some(InboundEvent {
        id,
        chat_id: chat_jid,
        sender_name: sender_name.unwrap_or_else(|| sender.clone()),
        sender_id: sender,
        content,
        timestamp: timestamp.unwrap_or_else(crate::now_timestamp),
        chat_kind,
        chat_name,
    })
}

/// Connection loop: read frames into `events`, write frames from `outbound`,
/// reconnect with capped backoff when the stream drops.
async fn run_socket(
    url: String,
    events: mpsc::Sender<InboundEvent>,
    mut outbound: mpsc::Receiver<OutboundFrame>,
) {
    let mut seen = SeenCache::new(SEEN_CACHE_TTL, SEEN_CACHE_CAPACITY);
    let mut attempt: u32 = 0;

    loop {
        let (stream, _) = match connect_async(url.as_str()).await {
            Ok(connected) => {
                attempt = 0;
                connected
            }
            Err(error) => {
                attempt += 1;
                let delay = reconnect_delay(attempt);
                tracing::warn!(%error, attempt, ?delay, "event socket connect failed, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
        };
        tracing::info!(url = %url, "event socket connected");
        let (mut sink, mut source) = stream.split();

        loop {
            tokio::select! {
                frame = source.next() => {
                    match frame {
                        Some(Ok(WsMessage::Text(raw))) => {
                            let parsed: InboundFrame = match serde_json::from_str(&raw) {
                                Ok(parsed) => parsed,
                                Err(error) => {
                                    tracing::debug!(%error, "dropping malformed bus frame");
                                    continue;
                                }
                            };
                            let Some(event) = normalize_frame(parsed) else {
                                continue;
                            };
                            if !seen.insert_if_new(&event.id, Instant::now()) {
                                tracing::debug!(id = %event.id, "suppressing redelivered message");
                                continue;
                            }
                            if events.send(event).await.is_err() {
                                tracing::warn!("inbound receiver dropped, closing socket loop");
                                return;
                            }
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            let _ = sink.send(WsMessage::Pong(payload)).await;
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            tracing::warn!("event socket closed, reconnecting");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            tracing::warn!(%error, "event socket read failed, reconnecting");
                            break;
                        }
                    }
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        return;
                    };
                    let raw = match serde_json::to_string(&frame) {
                        Ok(raw) => raw,
                        Err(error) => {
                            tracing::warn!(%error, "failed to encode outbound frame");
                            continue;
                        }
                    };
                    if let Err(error) = sink.send(WsMessage::text(raw)).await {
                        tracing::warn!(%error, "event socket write failed, reconnecting");
                        break;
                    }
                }
            }
        }

        attempt += 1;
        tokio::time::sleep(reconnect_delay(attempt)).await;
    }
}

#[async_trait]
impl Messenger for EventSocketMessenger {
    fn name(&self) -> &str {
        "event-socket"
    }

    async fn connect(&self) -> Result<()> {
        // Probe the endpoint once so missing credentials or a bad URL fail
        // startup; the listener owns the long-lived connection.
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|error| RouterError::Messenger(format!("socket connect failed: {error}")))?;
        drop(stream);
        Ok(())
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        self.enqueue(OutboundFrame::Send {
            chat_jid: chat_id.to_string(),
            text: text.to_string(),
        })
        .await
    }

    async fn send_or_update_status(
        &self,
        chat_id: &str,
        correlation_id: &str,
        text: &str,
        is_first: bool,
        _reply_to: Option<&str>,
    ) -> Result<()> {
        let mut statuses = self.statuses.lock().await;
        let entry = statuses
            .entry(correlation_id.to_string())
            .or_insert_with(|| StatusState {
                chat_id: chat_id.to_string(),
                text: String::new(),
            });

        if is_first || entry.text.is_empty() {
            entry.text = text.to_string();
        } else {
            entry.text = format!("{}\n{text}", entry.text);
        }
        let frame = OutboundFrame::Edit {
            chat_jid: entry.chat_id.clone(),
            client_ref: correlation_id.to_string(),
            text: entry.text.clone(),
        };
        drop(statuses);
        self.enqueue(frame).await
    }

    async fn clear_status(&self, chat_id: &str, correlation_id: Option<&str>) {
        let mut statuses = self.statuses.lock().await;
        match correlation_id {
            Some(correlation_id) => {
                statuses.remove(correlation_id);
            }
            None => statuses.retain(|_, entry| entry.chat_id != chat_id),
        }
    }

    async fn start_listener(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let (outbound_tx, outbound_rx) = mpsc::channel(256);
        *self.outbound_tx.lock().await = Some(outbound_tx);

        let url = self.url.clone();
        tokio::spawn(run_socket(url, tx, outbound_rx));
        Ok(())
    }

    fn needs_polling(&self) -> bool {
        false
    }
}
