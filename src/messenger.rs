//! Messenger abstraction: normalises one platform into a common event stream
//! and a send interface.

pub mod dedup;
pub mod polling;
pub mod socket;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
}

impl ChatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }
}

/// A platform event normalised to the router's one message shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    /// RFC-3339 UTC, string-orderable.
    pub timestamp: String,
    pub chat_kind: ChatKind,
    /// Display name of the chat, when the platform provides one.
    pub chat_name: Option<String>,
}

/// One entry of the in-band command catalogue, for platforms that support
/// command registration.
#[derive(Debug, Clone, Serialize)]
pub struct CommandSpec {
    pub name: &'static str,
    pub description: &'static str,
}

/// The common messenger contract.
///
/// `send` failures are the caller's to log, never to abort a batch on. Status
/// updates maintain at most one platform message per `(chat_id,
/// correlation_id)` pair.
#[async_trait]
pub trait Messenger: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the platform session. Fails fast when credentials are absent.
    async fn connect(&self) -> Result<()>;

    async fn send(&self, chat_id: &str, text: &str) -> Result<()>;

    /// Create or append to the single status message for this correlation id.
    /// If the platform rejects an edit, a fresh message is allocated and
    /// updates continue there.
    async fn send_or_update_status(
        &self,
        chat_id: &str,
        correlation_id: &str,
        text: &str,
        is_first: bool,
        reply_to: Option<&str>,
    ) -> Result<()>;

    /// Forget the tracked status message id(s) for a correlation id, or all
    /// of a chat's when `None`.
    async fn clear_status(&self, chat_id: &str, correlation_id: Option<&str>);

    /// Best-effort platform command registration.
    async fn register_commands(&self, commands: &[CommandSpec]) -> Result<()> {
        tracing::debug!(count = commands.len(), "command registration not supported");
        Ok(())
    }

    /// Subscribe to inbound events. Implementations spawn their own read
    /// loops and push normalised messages into `tx`.
    async fn start_listener(&self, tx: mpsc::Sender<InboundEvent>) -> Result<()>;

    /// When true the router must also tail the persistent store for new work;
    /// when false every inbound event arrives through the listener.
    fn needs_polling(&self) -> bool {
        false
    }

    /// Cadence hint for the store-tailing loop.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(2)
    }
}

/// Normalise a media message to its textual placeholder.
pub fn media_placeholder(kind: &str, caption: Option<&str>) -> String {
    match caption {
        Some(caption) if !caption.is_empty() => format!("<media:{kind}> {caption}"),
        _ => format!("<media:{kind}>"),
    }
}
