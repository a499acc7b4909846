//! Pull-based messenger: long-polls a bot HTTP API.
//!
//! Speaks the common `getMe`/`getUpdates`/`sendMessage`/`editMessageText`
//! bot-API shape. The router tails the store for this adapter
//! (`needs_polling() == true`); the listener only feeds ingestion.

use crate::error::{Result, RouterError};
use crate::messenger::{media_placeholder, ChatKind, CommandSpec, InboundEvent, Messenger};

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

const LONG_POLL_TIMEOUT_SECS: u64 = 30;
const RETRY_BASE_MS: u64 = 250;
const RETRY_CAP_MS: u64 = 30_000;

/// Bot-API messenger state.
pub struct BotApiMessenger {
    http: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    /// One tracked status message per correlation id.
    statuses: Mutex<HashMap<String, StatusMessage>>,
}

struct StatusMessage {
    chat_id: String,
    message_id: i64,
    text: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUpdate {
    update_id: i64,
    message: Option<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    message_id: i64,
    date: i64,
    chat: ApiChat,
    from: Option<ApiUser>,
    text: Option<String>,
    caption: Option<String>,
    photo: Option<serde_json::Value>,
    document: Option<serde_json::Value>,
    voice: Option<serde_json::Value>,
    video: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ApiChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUser {
    id: i64,
    first_name: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

impl BotApiMessenger {
    /// Build from the API base URL (token already embedded, e.g.
    /// `https://api.example.org/bot<TOKEN>`).
    pub fn new(base_url: &str, poll_interval: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(LONG_POLL_TIMEOUT_SECS + 30))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
            statuses: Mutex::new(HashMap::new()),
        })
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{method}", self.base_url)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T> {
        let response = self
            .http
            .post(self.url(method))
            .json(&body)
            .send()
            .await
            .map_err(|error| RouterError::Messenger(format!("{method} request failed: {error}")))?;

        let status = response.status();
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|error| RouterError::Messenger(format!("{method} bad response: {error}")))?;

        if !envelope.ok {
            return Err(RouterError::Messenger(format!(
                "{method} rejected (status {status}): {}",
                envelope.description.unwrap_or_default()
            )));
        }
        envelope
            .result
            .ok_or_else(|| RouterError::Messenger(format!("{method} returned no result")))
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> Result<SentMessage> {
        self.call(
            "sendMessage",
            serde_json::json!({ "chat_id": chat_id, "text": text }),
        )
        .await
    }

    async fn edit_message(&self, chat_id: &str, message_id: i64, text: &str) -> Result<()> {
        self.call::<serde_json::Value>(
            "editMessageText",
            serde_json::json!({ "chat_id": chat_id, "message_id": message_id, "text": text }),
        )
        .await?;
        Ok(())
    }

    async fn poll_loop(&self, tx: mpsc::Sender<InboundEvent>) {
        let mut offset: i64 = 0;
        let mut failures: u32 = 0;

        loop {
            let request = self
                .http
                .get(self.url("getUpdates"))
                .query(&[
                    ("timeout", LONG_POLL_TIMEOUT_SECS.to_string()),
                    ("offset", offset.to_string()),
                ])
                .send();

            let updates: Vec<ApiUpdate> = match request.await {
                Ok(response) => match response.json::<ApiEnvelope<Vec<ApiUpdate>>>().await {
                    Ok(envelope) if envelope.ok => envelope.result.unwrap_or_default(),
                    Ok(envelope) => {
                        failures += 1;
                        tracing::warn!(
                            description = %envelope.description.unwrap_or_default(),
                            attempt = failures,
                            "getUpdates rejected, retrying"
                        );
                        tokio::time::sleep(retry_delay(failures)).await;
                        continue;
                    }
                    Err(error) => {
                        failures += 1;
                        tracing::warn!(%error, attempt = failures, "getUpdates parse failed, retrying");
                        tokio::time::sleep(retry_delay(failures)).await;
                        continue;
                    }
                },
                Err(error) => {
                    failures += 1;
                    tracing::warn!(%error, attempt = failures, "getUpdates request failed, retrying");
                    tokio::time::sleep(retry_delay(failures)).await;
                    continue;
                }
            };
            failures = 0;

            for update in updates {
                // Advance before conversion so a poison update is never replayed.
                if update.update_id >= offset {
                    offset = update.update_id + 1;
                }
                let Some(message) = update.message else {
                    continue;
                };
                let Some(event) = normalize(message) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    tracing::warn!("inbound receiver dropped, stopping poll loop");
                    return;
                }
            }
        }
    }
}

fn retry_delay(attempt: u32) -> Duration {
    let exp = RETRY_BASE_MS.saturating_mul(1u64 << attempt.min(10).saturating_sub(1));
    Duration::from_millis(exp.min(RETRY_CAP_MS))
}

/// Flatten a platform message into the normalised event shape. Media become
/// `<media:KIND>` placeholders with the caption appended.
fn normalize(message: ApiMessage) -> Option<InboundEvent> {
    let content = if let Some(text) = message.text {
        text
    } else if message.photo.is_some() {
        media_placeholder("image", message.caption.as_deref())
    } else if message.document.is_some() {
        media_placeholder("document", message.caption.as_deref())
    } else if message.voice.is_some() {
        media_placeholder("audio", message.caption.as_deref())
    } else if message.video.is_some() {
        media_placeholder("video", message.caption.as_deref())
    } else {
        return None;
    };

    let sender = message.from?;
    let sender_name = sender
        .username
        .or(sender.first_name)
        .unwrap_or_else(|| sender.id.to_string());
    let chat_kind = if message.chat.kind == "private" {
        ChatKind::Private
    } else {
        ChatKind::Group
    };
    let timestamp = chrono::DateTime::from_timestamp(message.date, 0)
        .map(crate::format_timestamp)
        .unwrap_or_else(crate::now_timestamp);

    Some(InboundEvent {
        id: message.message_id.to_string(),
        chat_id: message.chat.id.to_string(),
        sender_id: sender.id.to_string(),
        sender_name,
        content,
        timestamp,
        chat_kind,
        chat_name: message.chat.title,
    })
}

#[async_trait]
impl Messenger for BotApiMessenger {
    fn name(&self) -> &str {
        "bot-api"
    }

    async fn connect(&self) -> Result<()> {
        let me: serde_json::Value = self.call("getMe", serde_json::json!({})).await?;
        tracing::info!(bot = %me.get("username").and_then(|v| v.as_str()).unwrap_or("?"),
            "bot API session established");
        Ok(())
    }

    async fn send(&self, chat_id: &str, text: &str) -> Result<()> {
        self.send_message(chat_id, text).await?;
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
        let mut statuses = self.statuses.lock().await;

        if is_first || !statuses.contains_key(correlation_id) {
            let sent = self.send_message(chat_id, text).await?;
            statuses.insert(
                correlation_id.to_string(),
                StatusMessage {
                    chat_id: chat_id.to_string(),
                    message_id: sent.message_id,
                    text: text.to_string(),
                },
            );
            return Ok(());
        }

        if let Some(entry) = statuses.get_mut(correlation_id) {
            entry.text = format!("{}\n{text}", entry.text);

            // An edit can be rejected when the message is too old or was
            // deleted; continue on a fresh message instead.
            if let Err(error) = self
                .edit_message(&entry.chat_id, entry.message_id, &entry.text)
                .await
            {
                tracing::debug!(%error, correlation_id, "status edit rejected, allocating fresh message");
                let sent = self.send_message(chat_id, &entry.text).await?;
                entry.message_id = sent.message_id;
                entry.chat_id = chat_id.to_string();
            }
        }
        Ok(())
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

    async fn register_commands(&self, commands: &[CommandSpec]) -> Result<()> {
        let list: Vec<serde_json::Value> = commands
            .iter()
            .map(|c| serde_json::json!({ "command": c.name, "description": c.description }))
            .collect();
        self.call::<serde_json::Value>("setMyCommands", serde_json::json!({ "commands": list }))
            .await?;
        Ok(())
    }

    async fn start_listener(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()> {
        let adapter = BotApiMessenger {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            poll_interval: self.poll_interval,
            statuses: Mutex::new(HashMap::new()),
        };
        tokio::spawn(async move {
            adapter.poll_loop(tx).await;
        });
        Ok(())
    }

    fn needs_polling(&self) -> bool {
        true
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}
