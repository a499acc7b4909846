//! Query layer over the router database.
//!
//! One `Store` handle per process, cloned freely (it only wraps the pool).
//! Each submodule contributes an `impl Store` block for its table family.

pub mod chats;
pub mod cursor;
pub mod messages;
pub mod sessions;
pub mod tasks;
pub mod workspaces;

pub use chats::{ChatOverview, DISCOVERY_SENTINEL};
pub use messages::{NewMessages, StoredMessage};
pub use tasks::{ContextMode, NewTask, ScheduleKind, ScheduledTask, TaskRunLog, TaskStatus};
pub use workspaces::{MountSpec, Workspace, WorkspaceContainerConfig, WorkspaceRegistry};

use sqlx::SqlitePool;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
