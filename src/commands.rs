//! In-band slash commands. Command handling is fully synchronous with the
//! batch — no agent is spawned for any of these.

use crate::config::Config;
use crate::error::Result;
use crate::messenger::CommandSpec;
use crate::store::{Store, StoredMessage, Workspace, WorkspaceRegistry};

use std::path::Path;

/// The command catalogue, also registered on platforms that support it.
pub const CATALOG: &[CommandSpec] = &[
    CommandSpec {
        name: "help",
        description: "Show available commands",
    },
    CommandSpec {
        name: "new",
        description: "Start a fresh agent session for this chat",
    },
    CommandSpec {
        name: "register",
        description: "Register this chat with the assistant (optional folder name)",
    },
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    New,
    Register { folder: Option<String> },
}

/// Parse a message as a command. The command token is case-insensitive.
pub fn parse(content: &str) -> Option<Command> {
    let trimmed = content.trim();
    let rest = trimmed.strip_prefix('/')?;
    let mut parts = rest.split_whitespace();
    let token = parts.next()?.to_ascii_lowercase();
    match token.as_str() {
        "help" => Some(Command::Help),
        "new" => Some(Command::New),
        "register" => Some(Command::Register {
            folder: parts.next().map(str::to_string),
        }),
        _ => None,
    }
}

/// Command interception over a batch: the first message decides, except that
/// `/register` is honoured anywhere in the batch.
pub fn intercept(messages: &[StoredMessage]) -> Option<(usize, Command)> {
    if let Some(first) = messages.first() {
        if let Some(command) = parse(&first.content) {
            return Some((0, command));
        }
    }
    messages.iter().enumerate().find_map(|(index, message)| {
        match parse(&message.content) {
            Some(command @ Command::Register { .. }) => Some((index, command)),
            _ => None,
        }
    })
}

/// Sanitise a chat name into a filesystem-safe folder: `[a-z0-9-]+`.
pub fn sanitize_folder(name: &str) -> String {
    let mut out = String::new();
    let mut last_dash = true;
    for ch in name.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

pub fn render_help(config: &Config) -> String {
    let mut out = format!("{} commands:\n", config.assistant_name);
    for command in CATALOG {
        out.push_str(&format!("/{} — {}\n", command.name, command.description));
    }
    out.trim_end().to_string()
}

/// Everything the command handlers need.
pub struct CommandContext<'a> {
    pub config: &'a Config,
    pub store: &'a Store,
    pub registry: &'a WorkspaceRegistry,
}

impl CommandContext<'_> {
    /// Execute a command for a chat and return the reply text.
    pub async fn handle(
        &self,
        command: &Command,
        chat_id: &str,
        sender_id: &str,
        is_private: bool,
    ) -> Result<String> {
        match command {
            Command::Help => Ok(render_help(self.config)),
            Command::New => self.handle_new(chat_id).await,
            Command::Register { folder } => {
                self.handle_register(chat_id, sender_id, is_private, folder.as_deref())
                    .await
            }
        }
    }

    async fn handle_new(&self, chat_id: &str) -> Result<String> {
        let Some(workspace) = self.registry.get(chat_id) else {
            return Ok("This chat is not registered yet. Use /register first.".to_string());
        };
        self.store.clear_session(&workspace.folder).await?;
        tracing::info!(folder = %workspace.folder, "session cleared by /new");
        Ok("Started a fresh session.".to_string())
    }

    /// `/register [folder]`. Allowed on unregistered chats; a private chat
    /// with no existing main workspace becomes the main session.
    async fn handle_register(
        &self,
        chat_id: &str,
        sender_id: &str,
        is_private: bool,
        explicit_folder: Option<&str>,
    ) -> Result<String> {
        if let Some(existing) = self.registry.get(chat_id) {
            return Ok(format!(
                "Already registered as \"{}\" (folder {}).",
                existing.name, existing.folder
            ));
        }

        let becomes_main = is_private && self.registry.main().is_none();

        let chat_name = self.store.chat_name(chat_id).await?;
        let folder = if becomes_main {
            self.config.main_folder.clone()
        } else {
            explicit_folder
                .map(sanitize_folder)
                .filter(|f| !f.is_empty())
                .or_else(|| {
                    chat_name
                        .as_deref()
                        .map(sanitize_folder)
                        .filter(|f| !f.is_empty())
                })
                .unwrap_or_else(|| format!("chat-{}", sanitize_folder(chat_id)))
        };

        if let Some(conflicting) = self.store.workspace_by_folder(&folder).await? {
            if conflicting.chat_id != chat_id {
                return Ok(format!(
                    "Folder \"{folder}\" is already taken by another chat. \
                     Try /register <folder>."
                ));
            }
        }

        let workspace = Workspace {
            chat_id: chat_id.to_string(),
            name: chat_name.unwrap_or_else(|| folder.clone()),
            folder: folder.clone(),
            // Group registrations fall back to the configured global trigger.
            trigger_word: String::new(),
            requires_trigger: !becomes_main && !is_private,
            is_main: becomes_main,
            allowed_users: is_private.then(|| vec![sender_id.to_string()]),
            added_at: crate::now_timestamp(),
            container: None,
        };

        match self.store.register_workspace(&workspace).await {
            Ok(()) => {}
            Err(crate::RouterError::Registration(reason)) => {
                return Ok(format!("Registration failed: {reason}"));
            }
            Err(error) => return Err(error),
        }
        self.registry.reload(self.store).await?;

        let dir = self.config.groups_root().join(&folder);
        if let Err(error) = std::fs::create_dir_all(&dir) {
            tracing::warn!(%error, dir = %dir.display(), "failed to create workspace folder");
        }

        if becomes_main {
            Ok(format!(
                "Registered this chat as the main session (folder {folder}). \
                 I will reply to every message here."
            ))
        } else if is_private {
            Ok(format!("Registered this chat (folder {folder})."))
        } else {
            Ok(format!(
                "Registered this group (folder {folder}). \
                 Mention {} to get my attention.",
                self.config.trigger_pattern
            ))
        }
    }
}

/// Ensure a workspace directory exists; used by recovery and the IPC
/// registrar as well as `/register`.
pub fn ensure_workspace_dir(groups_root: &Path, folder: &str) {
    let dir = groups_root.join(folder);
    if let Err(error) = std::fs::create_dir_all(&dir) {
        tracing::warn!(%error, dir = %dir.display(), "failed to create workspace folder");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Db;

    fn message(content: &str) -> StoredMessage {
        StoredMessage {
            message_id: "m1".to_string(),
            chat_id: "g1".to_string(),
            sender_id: "u1".to_string(),
            sender_name: "alice".to_string(),
            content: content.to_string(),
            timestamp: "2026-01-01T00:00:01.000Z".to_string(),
            is_from_me: false,
        }
    }

    #[test]
    fn command_token_is_case_insensitive() {
        assert_eq!(parse("/HELP"), Some(Command::Help));
        assert_eq!(parse("  /new"), Some(Command::New));
        assert_eq!(
            parse("/Register garden"),
            Some(Command::Register {
                folder: Some("garden".to_string())
            })
        );
        assert_eq!(parse("hello /help"), None);
        assert_eq!(parse("/unknown"), None);
    }

    #[test]
    fn register_is_honoured_anywhere_in_the_batch() {
        let batch = [message("hi there"), message("/register garden")];
        let (index, command) = intercept(&batch).unwrap();
        assert_eq!(index, 1);
        assert!(matches!(command, Command::Register { .. }));

        // Other commands only count as the first message.
        let batch = [message("hi there"), message("/new")];
        assert!(intercept(&batch).is_none());
        let batch = [message("/new"), message("hi")];
        assert_eq!(intercept(&batch).unwrap().0, 0);
    }

    #[test]
    fn folder_names_are_sanitised() {
        assert_eq!(sanitize_folder("Garden Club #1!"), "garden-club-1");
        assert_eq!(sanitize_folder("---"), "");
        assert_eq!(sanitize_folder("Ünicode Näme"), "nicode-n-me");
    }

    async fn context_fixture() -> (Db, Store, WorkspaceRegistry, Config) {
        let db = Db::connect_in_memory().await.unwrap();
        let store = Store::new(db.pool.clone());
        let registry = WorkspaceRegistry::new();
        let config = Config {
            data_dir: tempfile::tempdir().unwrap().keep(),
            ..Config::default()
        };
        (db, store, registry, config)
    }

    #[tokio::test]
    async fn first_private_registration_becomes_main() {
        let (_db, store, registry, config) = context_fixture().await;
        let ctx = CommandContext {
            config: &config,
            store: &store,
            registry: &registry,
        };

        let reply = ctx
            .handle(&Command::Register { folder: None }, "p1", "u1", true)
            .await
            .unwrap();
        assert!(reply.contains("main session"));

        let main = registry.main().unwrap();
        assert!(main.is_main);
        assert_eq!(main.folder, "main");
        assert_eq!(main.allowed_users.as_deref(), Some(&["u1".to_string()][..]));
        assert!(!main.requires_trigger);
    }

    #[tokio::test]
    async fn group_registration_uses_chat_name_and_global_trigger() {
        let (_db, store, registry, config) = context_fixture().await;
        store
            .upsert_chat("g1", Some("Garden Club"), "group", "2026-01-01T00:00:00.000Z")
            .await
            .unwrap();
        let ctx = CommandContext {
            config: &config,
            store: &store,
            registry: &registry,
        };

        let reply = ctx
            .handle(&Command::Register { folder: None }, "g1", "u1", false)
            .await
            .unwrap();
        assert!(reply.contains("garden-club"));

        let workspace = registry.get("g1").unwrap();
        assert_eq!(workspace.folder, "garden-club");
        assert!(workspace.trigger_word.is_empty());
        assert!(workspace.requires_trigger);
        assert!(!workspace.is_main);
        assert!(workspace.allowed_users.is_none());
    }

    #[tokio::test]
    async fn folder_collisions_are_reported_inline() {
        let (_db, store, registry, config) = context_fixture().await;
        let ctx = CommandContext {
            config: &config,
            store: &store,
            registry: &registry,
        };

        ctx.handle(
            &Command::Register {
                folder: Some("garden".to_string()),
            },
            "g1",
            "u1",
            false,
        )
        .await
        .unwrap();

        let reply = ctx
            .handle(
                &Command::Register {
                    folder: Some("garden".to_string()),
                },
                "g2",
                "u2",
                false,
            )
            .await
            .unwrap();
        assert!(reply.contains("already taken"));
        assert!(registry.get("g2").is_none());
    }

    #[tokio::test]
    async fn new_clears_the_stored_session() {
        let (_db, store, registry, config) = context_fixture().await;
        let ctx = CommandContext {
            config: &config,
            store: &store,
            registry: &registry,
        };
        ctx.handle(&Command::Register { folder: None }, "p1", "u1", true)
            .await
            .unwrap();
        store.store_session("main", "sess-1").await.unwrap();

        let reply = ctx.handle(&Command::New, "p1", "u1", true).await.unwrap();
        assert!(reply.contains("fresh session"));
        assert!(store.session_for("main").await.unwrap().is_none());
    }
}
