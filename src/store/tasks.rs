//! Scheduled tasks and their run history.

use super::Store;
use crate::error::{Result, RouterError};
use serde::{Deserialize, Serialize};
use sqlx::Row as _;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Once => "once",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "cron" => Ok(Self::Cron),
            "interval" => Ok(Self::Interval),
            "once" => Ok(Self::Once),
            other => Err(RouterError::InvalidSchedule(format!(
                "unknown schedule type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    Group,
    #[default]
    Isolated,
}

impl ContextMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Group => "group",
            Self::Isolated => "isolated",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "group" => Self::Group,
            _ => Self::Isolated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledTask {
    pub id: i64,
    pub folder: String,
    pub chat_id: String,
    pub prompt: String,
    pub kind: ScheduleKind,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub folder: String,
    pub chat_id: String,
    pub prompt: String,
    pub kind: ScheduleKind,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub next_run: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TaskRunLog {
    pub id: i64,
    pub task_id: i64,
    pub run_at: String,
    pub duration_ms: i64,
    pub success: bool,
    pub result: Option<String>,
}

fn map_task(row: &sqlx::sqlite::SqliteRow) -> Result<ScheduledTask> {
    let kind_raw: String = row.try_get("schedule_type")?;
    Ok(ScheduledTask {
        id: row.try_get("id")?,
        folder: row.try_get("folder")?,
        chat_id: row.try_get("chat_id")?,
        prompt: row.try_get("prompt")?,
        kind: ScheduleKind::parse(&kind_raw)?,
        schedule_value: row.try_get("schedule_value")?,
        context_mode: ContextMode::parse(&row.try_get::<String, _>("context_mode")?),
        next_run: row.try_get("next_run")?,
        last_run: row.try_get("last_run")?,
        last_result: row.try_get("last_result")?,
        status: row.try_get("status")?,
    })
}

const TASK_COLUMNS: &str = "id, folder, chat_id, prompt, schedule_type, schedule_value, \
                            context_mode, next_run, last_run, last_result, status";

impl Store {
    pub async fn create_task(&self, task: &NewTask) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO scheduled_tasks
                (folder, chat_id, prompt, schedule_type, schedule_value, context_mode,
                 next_run, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?)",
        )
        .bind(&task.folder)
        .bind(&task.chat_id)
        .bind(&task.prompt)
        .bind(task.kind.as_str())
        .bind(&task.schedule_value)
        .bind(task.context_mode.as_str())
        .bind(&task.next_run)
        .bind(crate::now_timestamp())
        .execute(self.pool())
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Active tasks whose `next_run` has passed, soonest first.
    pub async fn get_due_tasks(&self, now: &str) -> Result<Vec<ScheduledTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks
             WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?
             ORDER BY next_run"
        ))
        .bind(now)
        .fetch_all(self.pool())
        .await?;
        rows.iter().map(map_task).collect()
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<ScheduledTask>> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?"
        ))
        .bind(task_id)
        .fetch_optional(self.pool())
        .await?;
        row.as_ref().map(map_task).transpose()
    }

    /// Tasks visible in a workspace's snapshot file. `None` lists everything
    /// (main workspace view).
    pub async fn tasks_for_snapshot(&self, folder: Option<&str>) -> Result<Vec<ScheduledTask>> {
        let rows = match folder {
            Some(folder) => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                     WHERE folder = ? AND status IN ('active', 'paused')
                     ORDER BY id"
                ))
                .bind(folder)
                .fetch_all(self.pool())
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                     WHERE status IN ('active', 'paused')
                     ORDER BY id"
                ))
                .fetch_all(self.pool())
                .await?
            }
        };
        rows.iter().map(map_task).collect()
    }

    pub async fn set_task_status(&self, task_id: i64, status: TaskStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE scheduled_tasks SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(task_id)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record a completed dispatch: set `last_run`/`last_result` and either
    /// re-arm `next_run` or mark a one-shot task completed.
    pub async fn finish_task_run(
        &self,
        task_id: i64,
        last_run: &str,
        next_run: Option<&str>,
        last_result: Option<&str>,
    ) -> Result<()> {
        match next_run {
            Some(next) => {
                sqlx::query(
                    "UPDATE scheduled_tasks
                     SET last_run = ?, next_run = ?, last_result = COALESCE(?, last_result)
                     WHERE id = ?",
                )
                .bind(last_run)
                .bind(next)
                .bind(last_result)
                .bind(task_id)
                .execute(self.pool())
                .await?;
            }
            None => {
                sqlx::query(
                    "UPDATE scheduled_tasks
                     SET last_run = ?, next_run = NULL, status = 'completed',
                         last_result = COALESCE(?, last_result)
                     WHERE id = ?",
                )
                .bind(last_run)
                .bind(last_result)
                .bind(task_id)
                .execute(self.pool())
                .await?;
            }
        }
        Ok(())
    }

    pub async fn record_task_result(&self, task_id: i64, result: &str) -> Result<()> {
        sqlx::query("UPDATE scheduled_tasks SET last_result = ? WHERE id = ?")
            .bind(result)
            .bind(task_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Remove a task and its run history atomically.
    pub async fn cancel_task(&self, task_id: i64) -> Result<bool> {
        let mut tx = self.pool().begin().await?;
        sqlx::query("DELETE FROM task_run_logs WHERE task_id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM scheduled_tasks WHERE id = ?")
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn log_task_run(
        &self,
        task_id: i64,
        run_at: &str,
        duration_ms: i64,
        success: bool,
        result: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_run_logs (task_id, run_at, duration_ms, success, result)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(task_id)
        .bind(run_at)
        .bind(duration_ms)
        .bind(success as i64)
        .bind(result)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn recent_task_runs(&self, task_id: i64, limit: i64) -> Result<Vec<TaskRunLog>> {
        let rows = sqlx::query(
            "SELECT id, task_id, run_at, duration_ms, success, result
             FROM task_run_logs
             WHERE task_id = ?
             ORDER BY run_at DESC
             LIMIT ?",
        )
        .bind(task_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| TaskRunLog {
                id: row.try_get("id").unwrap_or_default(),
                task_id: row.try_get("task_id").unwrap_or_default(),
                run_at: row.try_get("run_at").unwrap_or_default(),
                duration_ms: row.try_get("duration_ms").unwrap_or_default(),
                success: row.try_get::<i64, _>("success").unwrap_or(0) != 0,
                result: row.try_get("result").ok(),
            })
            .collect())
    }
}
