//! Operator configuration, loaded from a TOML file.

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Display name the assistant replies under. Outbound messages are
    /// prefixed `"<name>: "` so the ingestion filter can drop echoes.
    #[serde(default = "default_assistant_name")]
    pub assistant_name: String,

    /// Global trigger pattern for group workspaces that did not set their own
    /// trigger word.
    #[serde(default = "default_trigger_pattern")]
    pub trigger_pattern: String,

    /// Reserved folder name of the main (privileged) workspace.
    #[serde(default = "default_main_folder")]
    pub main_folder: String,

    /// IANA timezone used for cron schedule evaluation.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Root directory for the database, workspaces and (by default) the IPC
    /// tree.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// IPC tree root. Defaults to `<data_dir>/ipc`.
    pub ipc_dir: Option<PathBuf>,

    /// Workspace folders root. Defaults to `<data_dir>/groups`.
    pub groups_dir: Option<PathBuf>,

    /// Host-only file listing allowed mount roots, one per line. This path is
    /// never itself mounted into any container.
    #[serde(default = "default_mount_allowlist")]
    pub mount_allowlist_file: PathBuf,

    /// Cadence of the store-tail loop for polling messengers, milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Cadence of the IPC directory scan, milliseconds.
    #[serde(default = "default_ipc_poll_interval_ms")]
    pub ipc_poll_interval_ms: u64,

    /// Cadence of the scheduler tick, seconds.
    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub container: ContainerConfig,

    #[serde(default)]
    pub messenger: MessengerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Safety cap on concurrently processing chats.
    #[serde(default = "default_max_parallel_chats")]
    pub max_parallel_chats: usize,

    /// Base delay of the retry backoff curve, milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Backoff ceiling, milliseconds.
    #[serde(default = "default_retry_cap_ms")]
    pub retry_cap_ms: u64,

    /// Attempts before a chat's batch is abandoned.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_parallel_chats: default_max_parallel_chats(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap_ms: default_retry_cap_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Container CLI to shell out to (`docker` or `podman`).
    #[serde(default = "default_engine")]
    pub engine: String,

    /// Image the agent runs in.
    #[serde(default = "default_image")]
    pub image: String,

    /// Command executed inside the container. Empty uses the image default.
    #[serde(default)]
    pub command: Vec<String>,

    /// Workspace mount point inside the container.
    #[serde(default = "default_workspace_mount")]
    pub workspace_mount: String,

    /// Per-batch timeout, seconds. Workspaces may override this.
    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            image: default_image(),
            command: Vec::new(),
            workspace_mount: default_workspace_mount(),
            batch_timeout_secs: default_batch_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessengerConfig {
    #[serde(default)]
    pub kind: MessengerKind,

    /// Base URL of the bot HTTP API (polling variant), token already applied.
    pub api_url: Option<String>,

    /// File holding the bot API token (polling variant).
    pub token_file: Option<PathBuf>,

    /// WebSocket endpoint of the event bus (socket variant).
    pub socket_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessengerKind {
    #[default]
    Polling,
    Socket,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Prefix carried by the assistant's own outbound messages.
    pub fn bot_prefix(&self) -> String {
        format!("{}:", self.assistant_name)
    }

    pub fn ipc_root(&self) -> PathBuf {
        self.ipc_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("ipc"))
    }

    pub fn groups_root(&self) -> PathBuf {
        self.groups_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("groups"))
    }

    /// Resolve the configured timezone, falling back to UTC on a bad name.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or_else(|_| {
            tracing::warn!(timezone = %self.timezone, "unknown timezone, falling back to UTC");
            chrono_tz::UTC
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            assistant_name: default_assistant_name(),
            trigger_pattern: default_trigger_pattern(),
            main_folder: default_main_folder(),
            timezone: default_timezone(),
            data_dir: default_data_dir(),
            ipc_dir: None,
            groups_dir: None,
            mount_allowlist_file: default_mount_allowlist(),
            poll_interval_ms: default_poll_interval_ms(),
            ipc_poll_interval_ms: default_ipc_poll_interval_ms(),
            scheduler_interval_secs: default_scheduler_interval_secs(),
            queue: QueueConfig::default(),
            container: ContainerConfig::default(),
            messenger: MessengerConfig::default(),
        }
    }
}

fn default_assistant_name() -> String {
    "Andy".to_string()
}

fn default_trigger_pattern() -> String {
    "@andy".to_string()
}

fn default_main_folder() -> String {
    "main".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_mount_allowlist() -> PathBuf {
    PathBuf::from("/etc/nanoclaw/mount-allowlist")
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_ipc_poll_interval_ms() -> u64 {
    500
}

fn default_scheduler_interval_secs() -> u64 {
    30
}

fn default_max_parallel_chats() -> usize {
    8
}

fn default_retry_base_ms() -> u64 {
    1_000
}

fn default_retry_cap_ms() -> u64 {
    300_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_engine() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "nanoclaw-agent:latest".to_string()
}

fn default_workspace_mount() -> String {
    "/workspace".to_string()
}

fn default_batch_timeout_secs() -> u64 {
    300
}
