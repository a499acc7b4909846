//! Crate-wide error type.

use thiserror::Error;

/// Errors surfaced by the router and its components.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("messenger error: {0}")]
    Messenger(String),

    #[error("container engine unavailable: {0}")]
    ContainerUnavailable(String),

    #[error("agent run failed: {0}")]
    Agent(String),

    #[error("agent run timed out after {0} seconds")]
    AgentTimeout(u64),

    #[error("invalid schedule value: {0}")]
    InvalidSchedule(String),

    #[error("unauthorized IPC request from workspace {workspace}: {action}")]
    UnauthorizedIpc { workspace: String, action: String },

    #[error("registration failed: {0}")]
    Registration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RouterError>;
