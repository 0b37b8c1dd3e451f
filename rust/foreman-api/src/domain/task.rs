//! Task model and status state machine.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Commands-run entries are clamped to this length before insertion so
/// payloads stay bounded.
pub const MAX_COMMAND_LEN: usize = 200;

/// Task status. `Completed`, `Failed`, and `Cancelled` are terminal; a task
/// takes exactly one terminal transition in its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted locally, not yet acknowledged by a worker.
    Pending,
    /// Buffered in the offline queue for a disconnected worker.
    Queued,
    /// Acknowledged and executing.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether this status ends the task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal transitions:
    /// `pending ⇄ queued`, `pending|queued → running`, any non-terminal
    /// → terminal. Nothing leaves a terminal state.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Self::Pending, Self::Queued) | (Self::Queued, Self::Pending) => true,
            (Self::Pending | Self::Queued, Self::Running) => true,
            (_, next) if next.is_terminal() => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Aggregate usage reported by the worker. Frozen once the task is terminal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    /// Unordered set of files the execution touched.
    pub files_changed: BTreeSet<String>,
    /// Unordered set of shell commands the execution ran, clamped to
    /// [`MAX_COMMAND_LEN`] chars per entry.
    pub commands_run: BTreeSet<String>,
    pub duration_ms: u64,
}

impl TaskUsage {
    /// Record a command string, clamping it before insertion.
    pub fn record_command(&mut self, command: &str) {
        let clamped: String = command.chars().take(MAX_COMMAND_LEN).collect();
        self.commands_run.insert(clamped);
    }

    /// Fold another usage report into this one (continuations accumulate).
    pub fn absorb(&mut self, other: &TaskUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.estimated_cost += other.estimated_cost;
        self.duration_ms += other.duration_ms;
        self.files_changed.extend(other.files_changed.iter().cloned());
        for cmd in &other.commands_run {
            self.record_command(cmd);
        }
    }
}

/// Chat correlation: where the task came from and which message carries the
/// status reaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatAnchor {
    pub channel_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    pub user_id: String,
    /// Timestamp id of the user message whose reaction mirrors task status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anchor_ts: Option<String>,
}

/// One unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Time-sortable unique id.
    pub id: String,
    pub project_id: String,
    /// Worker the task was (last) dispatched to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub bot_name: String,
    pub command: String,
    /// For `decompose` parents, the command the user originally issued; the
    /// fallback child inherits it when the plan parses to nothing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_command: Option<String>,
    pub prompt: String,
    pub system_prompt: String,
    pub model: String,
    pub max_budget: f64,
    pub allowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    pub chat: ChatAnchor,
    pub status: TaskStatus,
    /// Assigned by the worker on first report; null until then.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub usage: TaskUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Continuations consumed so far.
    pub continuations: u32,
    pub max_continuations: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Error produced by an illegal status transition.
#[derive(Debug, thiserror::Error)]
#[error("illegal task transition {from} -> {to} for task {task_id}")]
pub struct IllegalTransition {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

impl Task {
    /// Generate a fresh time-sortable task id.
    pub fn new_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Whether the task has taken its terminal transition.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a status transition, enforcing the one-way state machine.
    ///
    /// Terminal states are absorbing: re-applying the same terminal status is
    /// reported as an error the caller may treat as an idempotent no-op.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), IllegalTransition> {
        if !self.status.can_transition_to(next) {
            return Err(IllegalTransition {
                task_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Whether the continuation budget allows another invocation.
    pub fn can_continue(&self) -> bool {
        self.continuations < self.max_continuations
    }
}
