//! Scheduled task submissions: one-shot and recurring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Minimum period between recurring executions.
pub const MIN_RECURRING_INTERVAL_SECS: i64 = 3600;

/// Schedule lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ScheduleStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// When a schedule fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    /// Fire once at the given wall time.
    Once { run_at: DateTime<Utc> },
    /// Fire on a cron expression evaluated in a named time zone.
    Cron { expression: String, timezone: String },
}

/// A stored future submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: String,
    pub project_id: String,
    pub bot_name: String,
    pub command: String,
    pub prompt: String,
    /// Chat user the scheduled submission is attributed to.
    pub user_id: String,
    pub recurrence: Recurrence,
    /// Next wall time the tick should fire this schedule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub status: ScheduleStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Schedule {
    /// Whether the tick should fire this schedule at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.enabled
            && !self.status.is_terminal()
            && self.status != ScheduleStatus::Paused
            && self.next_run_at.map_or(false, |next| next <= now)
    }
}
