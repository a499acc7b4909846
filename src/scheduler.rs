//! Scheduled-task engine. The scheduler only finds due tasks and stages
//! them; execution always goes through the per-chat queue so serialisation
//! holds for scheduled work too.

use crate::error::{Result, RouterError};
use crate::queue::ChatQueue;
use crate::store::{ScheduleKind, ScheduledTask, Store};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr as _;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Hand-off point between the scheduler and the queue processor: due tasks
/// wait here, keyed by chat, until the chat's worker drains them.
#[derive(Clone, Default)]
pub struct TaskStage {
    inner: Arc<Mutex<HashMap<String, Vec<ScheduledTask>>>>,
}

impl TaskStage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stage(&self, task: ScheduledTask) {
        self.inner
            .lock()
            .await
            .entry(task.chat_id.clone())
            .or_default()
            .push(task);
    }

    pub async fn drain(&self, chat_id: &str) -> Vec<ScheduledTask> {
        self.inner.lock().await.remove(chat_id).unwrap_or_default()
    }
}

/// Accept standard 5-field cron by prepending a seconds field; the parser
/// itself wants 6 or 7 fields.
fn normalize_cron(expression: &str) -> String {
    let fields = expression.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expression.trim())
    } else {
        expression.trim().to_string()
    }
}

/// First fire time for a newly created schedule.
pub fn initial_next_run(
    kind: ScheduleKind,
    value: &str,
    tz: chrono_tz::Tz,
    from: DateTime<Utc>,
) -> Result<Option<String>> {
    match kind {
        ScheduleKind::Once => {
            let instant = DateTime::parse_from_rfc3339(value).map_err(|error| {
                RouterError::InvalidSchedule(format!("bad timestamp {value:?}: {error}"))
            })?;
            Ok(Some(crate::format_timestamp(instant.with_timezone(&Utc))))
        }
        _ => next_after_fire(kind, value, tz, from),
    }
}

/// Fire time following a dispatch. `once` schedules end here.
pub fn next_after_fire(
    kind: ScheduleKind,
    value: &str,
    tz: chrono_tz::Tz,
    from: DateTime<Utc>,
) -> Result<Option<String>> {
    match kind {
        ScheduleKind::Cron => {
            let schedule = Schedule::from_str(&normalize_cron(value)).map_err(|error| {
                RouterError::InvalidSchedule(format!("bad cron expression {value:?}: {error}"))
            })?;
            let next = schedule
                .after(&from.with_timezone(&tz))
                .next()
                .map(|instant| crate::format_timestamp(instant.with_timezone(&Utc)));
            Ok(next)
        }
        ScheduleKind::Interval => {
            let millis: i64 = value.parse().map_err(|_| {
                RouterError::InvalidSchedule(format!("bad interval (expected ms): {value:?}"))
            })?;
            if millis <= 0 {
                return Err(RouterError::InvalidSchedule(format!(
                    "interval must be positive: {value:?}"
                )));
            }
            Ok(Some(crate::format_timestamp(
                from + ChronoDuration::milliseconds(millis),
            )))
        }
        ScheduleKind::Once => Ok(None),
    }
}

pub struct Scheduler {
    store: Store,
    queue: Arc<ChatQueue>,
    stage: TaskStage,
    tz: chrono_tz::Tz,
    interval: std::time::Duration,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(
        store: Store,
        queue: Arc<ChatQueue>,
        stage: TaskStage,
        tz: chrono_tz::Tz,
        interval: std::time::Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            queue,
            stage,
            tz,
            interval,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        tracing::info!("scheduler loop shutting down");
                        break;
                    }
                    _ = ticker.tick() => {}
                }
                if let Err(error) = self.tick().await {
                    tracing::warn!(%error, "scheduler tick failed");
                }
            }
        })
    }

    /// One pass: stage every due task, enqueue its chat, and advance its
    /// schedule. The run log is written by the processor when the task
    /// actually executes.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();
        let now_ts = crate::format_timestamp(now);
        let due = self.store.get_due_tasks(&now_ts).await?;

        for task in due {
            tracing::info!(
                task_id = task.id,
                folder = %task.folder,
                kind = task.kind.as_str(),
                "dispatching scheduled task"
            );

            self.stage.stage(task.clone()).await;
            self.queue.enqueue(&task.chat_id).await;

            match next_after_fire(task.kind, &task.schedule_value, self.tz, now) {
                Ok(next) => {
                    self.store
                        .finish_task_run(task.id, &now_ts, next.as_deref(), None)
                        .await?;
                }
                Err(error) => {
                    // A schedule that no longer computes cannot fire again;
                    // retire it rather than re-dispatching every tick.
                    tracing::warn!(%error, task_id = task.id, "schedule no longer computes, retiring task");
                    self.store
                        .finish_task_run(task.id, &now_ts, None, Some(&error.to_string()))
                        .await?;
                }
            }
        }
        Ok(())
    }
}
