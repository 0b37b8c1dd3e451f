//! Scheduler: time-based and cron-based future task submission.

pub mod cron;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::commands::{CommandService, SubmitError, UserCommand};
use crate::domain::{
    schedule::MIN_RECURRING_INTERVAL_SECS, Recurrence, Schedule, ScheduleStatus,
};
use crate::storage::{Storage, StorageError};
use self::cron::CronExpression;

/// Schedule creation/validation failures.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    #[error("unknown timezone: {0}")]
    InvalidTimezone(String),

    #[error("recurring schedules may fire at most hourly")]
    TooFrequent,

    #[error("one-shot run time is in the past")]
    InThePast,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Draft for a new schedule.
#[derive(Debug, Clone)]
pub struct ScheduleDraft {
    pub project_id: String,
    pub bot_name: String,
    pub command: String,
    pub prompt: String,
    pub user_id: String,
    pub recurrence: Recurrence,
}

/// Periodic driver that submits due schedules through the command service.
pub struct Scheduler {
    storage: Storage,
    commands: Arc<CommandService>,
}

impl Scheduler {
    pub fn new(storage: Storage, commands: Arc<CommandService>) -> Self {
        Self { storage, commands }
    }

    /// Validate and persist a schedule, computing its first execution time.
    pub async fn create(&self, draft: ScheduleDraft) -> Result<String, ScheduleError> {
        let now = Utc::now();
        let next_run_at = match &draft.recurrence {
            Recurrence::Once { run_at } => {
                if *run_at <= now {
                    return Err(ScheduleError::InThePast);
                }
                Some(*run_at)
            }
            Recurrence::Cron {
                expression,
                timezone,
            } => {
                let parsed = CronExpression::parse(expression)
                    .map_err(|e| ScheduleError::InvalidCron(e.to_string()))?;
                let tz = cron::parse_timezone(timezone)
                    .map_err(|_| ScheduleError::InvalidTimezone(timezone.clone()))?;
                let first = parsed
                    .next_after(now, tz)
                    .ok_or_else(|| ScheduleError::InvalidCron(expression.clone()))?;
                let second = parsed
                    .next_after(first, tz)
                    .ok_or_else(|| ScheduleError::InvalidCron(expression.clone()))?;
                if (second - first).num_seconds() < MIN_RECURRING_INTERVAL_SECS {
                    return Err(ScheduleError::TooFrequent);
                }
                Some(first)
            }
        };

        let schedule = Schedule {
            id: uuid::Uuid::now_v7().to_string(),
            project_id: draft.project_id,
            bot_name: draft.bot_name,
            command: draft.command,
            prompt: draft.prompt,
            user_id: draft.user_id,
            recurrence: draft.recurrence,
            next_run_at,
            enabled: true,
            status: ScheduleStatus::Active,
            created_at: now,
            last_run_at: None,
        };
        self.storage.schedules.create(&schedule).await?;
        tracing::info!(schedule_id = %schedule.id, next = ?schedule.next_run_at, "schedule created");
        Ok(schedule.id)
    }

    /// One tick: submit every past-due schedule and recompute recurrences.
    pub async fn tick(&self) {
        let now = Utc::now();
        let due = match self.storage.schedules.due(now).await {
            Ok(due) => due,
            Err(err) => {
                tracing::error!(error = %err, "due-schedule scan failed");
                return;
            }
        };
        for mut schedule in due {
            let result = self.fire(&schedule).await;
            schedule.last_run_at = Some(now);
            match (&schedule.recurrence, result) {
                (Recurrence::Once { .. }, Ok(())) => {
                    schedule.status = ScheduleStatus::Completed;
                    schedule.next_run_at = None;
                }
                (Recurrence::Once { .. }, Err(err)) => {
                    tracing::error!(schedule_id = %schedule.id, error = %err, "one-shot failed");
                    schedule.status = ScheduleStatus::Failed;
                    schedule.next_run_at = None;
                }
                (
                    Recurrence::Cron {
                        expression,
                        timezone,
                    },
                    outcome,
                ) => {
                    if let Err(err) = outcome {
                        tracing::error!(schedule_id = %schedule.id, error = %err, "recurring fire failed");
                    }
                    schedule.status = ScheduleStatus::Active;
                    schedule.next_run_at = CronExpression::parse(expression)
                        .ok()
                        .zip(cron::parse_timezone(timezone).ok())
                        .and_then(|(parsed, tz)| parsed.next_after(now, tz));
                    if schedule.next_run_at.is_none() {
                        tracing::error!(schedule_id = %schedule.id, "recurrence no longer evaluates");
                        schedule.status = ScheduleStatus::Failed;
                    }
                }
            }
            if let Err(err) = self.storage.schedules.update(&schedule).await {
                tracing::error!(schedule_id = %schedule.id, error = %err, "schedule update failed");
            }
        }
    }

    async fn fire(&self, schedule: &Schedule) -> Result<(), SubmitError> {
        let project = self
            .storage
            .projects
            .get(&schedule.project_id)
            .await?
            .ok_or_else(|| SubmitError::UnknownChannel(schedule.project_id.clone()))?;

        tracing::info!(schedule_id = %schedule.id, "firing schedule");
        self.commands
            .handle(UserCommand {
                channel_id: project.channel_id,
                thread_ts: None,
                user_id: schedule.user_id.clone(),
                anchor_ts: None,
                bot_name: schedule.bot_name.clone(),
                command: schedule.command.clone(),
                prompt: schedule.prompt.clone(),
                attachments: Vec::new(),
            })
            .await
            .map(|_| ())
    }

    /// Spawn the minute tick.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                scheduler.tick().await;
            }
        })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}
