//! Database connection management and migrations.

use crate::error::Result;
use anyhow::Context as _;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row as _, SqlitePool};
use std::path::Path;

/// SQLite connection bundle for the router.
pub struct Db {
    pub pool: SqlitePool,
}

impl Db {
    /// Open (creating if needed) the database under `data_dir` and bring the
    /// schema up to date.
    pub async fn connect(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir).with_context(|| {
            format!("failed to create data directory: {}", data_dir.display())
        })?;

        let url = format!("sqlite:{}?mode=rwc", data_dir.join("nanoclaw.db").display());
        let pool = SqlitePool::connect(&url)
            .await
            .with_context(|| "failed to connect to SQLite")?;

        sqlx::query("PRAGMA journal_mode=WAL").execute(&pool).await?;
        migrate(&pool).await?;

        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps every handle
    /// on the same memory store.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .with_context(|| "failed to open in-memory SQLite")?;
        migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Close the pool gracefully.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// Create the base schema and apply idempotent additive migrations.
///
/// Columns added after the initial release are guarded by `table_has_column`
/// so startup can re-run against any prior schema.
async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(
        "CREATE TABLE IF NOT EXISTS chats (
            chat_id TEXT PRIMARY KEY,
            name TEXT,
            kind TEXT NOT NULL DEFAULT 'group',
            last_message_time TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            message_id TEXT NOT NULL,
            chat_id TEXT NOT NULL,
            sender_id TEXT NOT NULL,
            sender_name TEXT NOT NULL,
            content TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            is_from_me INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (message_id, chat_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_chat_timestamp
            ON messages(chat_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_messages_timestamp
            ON messages(timestamp);

        CREATE TABLE IF NOT EXISTS registered_workspaces (
            chat_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            folder TEXT NOT NULL UNIQUE,
            trigger_word TEXT NOT NULL DEFAULT '',
            requires_trigger INTEGER NOT NULL DEFAULT 1,
            is_main INTEGER NOT NULL DEFAULT 0,
            allowed_users TEXT,
            added_at TEXT NOT NULL,
            container_config TEXT
        );

        CREATE TABLE IF NOT EXISTS sessions (
            folder TEXT PRIMARY KEY,
            session_id TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS router_state (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agent_cursors (
            chat_id TEXT PRIMARY KEY,
            last_timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS scheduled_tasks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            folder TEXT NOT NULL,
            chat_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            schedule_type TEXT NOT NULL,
            schedule_value TEXT NOT NULL,
            next_run TEXT,
            last_run TEXT,
            status TEXT NOT NULL DEFAULT 'active',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_status_next
            ON scheduled_tasks(status, next_run);
        CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_next
            ON scheduled_tasks(next_run);

        CREATE TABLE IF NOT EXISTS task_run_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id INTEGER NOT NULL,
            run_at TEXT NOT NULL,
            duration_ms INTEGER NOT NULL,
            success INTEGER NOT NULL DEFAULT 1,
            result TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_task_run_logs_task_run
            ON task_run_logs(task_id, run_at);",
    )
    .execute(pool)
    .await?;

    // Additive columns introduced after the base schema.
    ensure_column(
        pool,
        "scheduled_tasks",
        "context_mode",
        "TEXT NOT NULL DEFAULT 'isolated'",
    )
    .await?;
    ensure_column(pool, "scheduled_tasks", "last_result", "TEXT").await?;

    Ok(())
}

/// Add a column if the table does not have it yet.
async fn ensure_column(
    pool: &SqlitePool,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    if !table_has_column(pool, table, column).await? {
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))
            .execute(pool)
            .await?;
    }
    Ok(())
}

async fn table_has_column(pool: &SqlitePool, table: &str, column: &str) -> Result<bool> {
    // PRAGMA does not support parameter binding; table names here come from
    // the migration code above, never from input.
    let rows = sqlx::query(&format!("PRAGMA table_info({table})"))
        .fetch_all(pool)
        .await?;
    for row in rows {
        let name: String = row.try_get("name")?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let db = Db::connect_in_memory().await.unwrap();
        // Re-running the full migration against an up-to-date schema is a no-op.
        migrate(&db.pool).await.unwrap();
        assert!(table_has_column(&db.pool, "scheduled_tasks", "context_mode")
            .await
            .unwrap());
        assert!(table_has_column(&db.pool, "scheduled_tasks", "last_result")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn context_mode_defaults_to_isolated() {
        let db = Db::connect_in_memory().await.unwrap();
        sqlx::query(
            "INSERT INTO scheduled_tasks (folder, chat_id, prompt, schedule_type, schedule_value, created_at)
             VALUES ('main', 'chat-1', 'do it', 'once', '2026-01-01T00:00:00.000Z', '2026-01-01T00:00:00.000Z')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let mode: String =
            sqlx::query_scalar("SELECT context_mode FROM scheduled_tasks WHERE id = 1")
                .fetch_one(&db.pool)
                .await
                .unwrap();
        assert_eq!(mode, "isolated");
    }
}
