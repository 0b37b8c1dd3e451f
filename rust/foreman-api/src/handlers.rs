//! Task lifecycle handlers: every status transition a worker event can
//! cause lives here.
//!
//! Handlers are idempotent per task id. Events referencing unknown tasks
//! (purged, or never existed) are warned about and dropped; nothing a
//! worker sends can tear down its connection.

use std::sync::Arc;

use crate::chat::{reaction, ChatNotifier};
use crate::domain::{Task, TaskStatus};
use crate::storage::{AuditEntry, Storage};
use crate::streaming::StreamAccumulator;
use crate::workflow::{WorkflowDriver, MAX_TURNS_MARKER};
use foreman_protocol::{
    ProgressKind, TaskAck, TaskCancelled, TaskComplete, TaskError, TaskProgress, TaskStream,
};

/// Sentinel prefix a worker can put on a result line to request a file
/// upload into the thread: `ATTACH_FILE:<path>|<caption>`.
const ATTACH_SENTINEL: &str = "ATTACH_FILE:";

/// Owns the task state machine on the cloud side.
pub struct LifecycleHandlers {
    storage: Storage,
    chat: Arc<ChatNotifier>,
    streams: Arc<StreamAccumulator>,
    driver: Arc<WorkflowDriver>,
}

impl LifecycleHandlers {
    pub fn new(
        storage: Storage,
        chat: Arc<ChatNotifier>,
        streams: Arc<StreamAccumulator>,
        driver: Arc<WorkflowDriver>,
    ) -> Self {
        Self {
            storage,
            chat,
            streams,
            driver,
        }
    }

    async fn load(&self, task_id: &str) -> Option<Task> {
        match self.storage.tasks.get(task_id).await {
            Ok(Some(task)) => Some(task),
            Ok(None) => {
                tracing::warn!(task_id, "event for unknown task dropped");
                None
            }
            Err(err) => {
                tracing::error!(task_id, error = %err, "task lookup failed");
                None
            }
        }
    }

    /// Worker accepted (or rejected) a submit.
    pub async fn on_ack(&self, agent_id: &str, payload: TaskAck) {
        let Some(mut task) = self.load(&payload.task_id).await else {
            return;
        };
        if task.is_terminal() {
            tracing::debug!(task_id = %task.id, "ack after terminal state ignored");
            return;
        }
        if !payload.accepted {
            let reason = payload
                .reason
                .unwrap_or_else(|| "worker rejected the task".to_string());
            tracing::warn!(task_id = %task.id, agent_id, reason, "submit rejected");
            self.fail_task(&mut task, &reason, true).await;
            return;
        }
        if task.status == TaskStatus::Running {
            return; // duplicate ack
        }
        task.agent_id = Some(agent_id.to_string());
        if task.transition(TaskStatus::Running).is_ok() {
            if let Err(err) = self.storage.tasks.update(&task).await {
                tracing::error!(task_id = %task.id, error = %err, "ack persist failed");
            }
            tracing::info!(task_id = %task.id, agent_id, "task running");
        }
    }

    /// Discrete execution step; forwarded to the stream accumulator.
    pub async fn on_progress(&self, _agent_id: &str, payload: TaskProgress) {
        let Some(mut task) = self.load(&payload.task_id).await else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        let step = match payload.kind {
            ProgressKind::ToolUse => payload.message.clone(),
            ProgressKind::Thinking => format!("_{}_", payload.message),
            ProgressKind::Info => payload.message.clone(),
        };
        self.streams.on_progress(&task, step).await;

        // A progress event from a worker that never acked still means the
        // task is running.
        if task.status == TaskStatus::Pending && task.transition(TaskStatus::Running).is_ok() {
            let _ = self.storage.tasks.update(&task).await;
        }
    }

    /// Incremental output text; buffered and throttled by the accumulator.
    pub async fn on_stream(&self, _agent_id: &str, payload: TaskStream) {
        let Some(task) = self.load(&payload.task_id).await else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        self.streams.on_stream(&task, &payload.delta).await;
    }

    /// Terminal success. Applying the same payload twice persists the same
    /// row; the second call is a no-op apart from the audit entry.
    pub async fn on_complete(&self, agent_id: &str, payload: TaskComplete) {
        let Some(mut task) = self.load(&payload.task_id).await else {
            return;
        };

        // Planning parents hand their result to the decomposition driver
        // and stay non-terminal until the children aggregate.
        if task.command == "decompose" && !task.is_terminal() {
            self.driver.on_plan_complete(&mut task, &payload).await;
            let _ = self
                .storage
                .audit
                .append(
                    AuditEntry::new("task.plan_completed", serde_json::json!({}))
                        .for_task(&task.id)
                        .for_agent(agent_id),
                )
                .await;
            return;
        }

        if task.is_terminal() {
            let _ = self
                .storage
                .audit
                .append(
                    AuditEntry::new("task.duplicate_complete", serde_json::json!({}))
                        .for_task(&task.id)
                        .for_agent(agent_id),
                )
                .await;
            return;
        }

        self.streams.finish(&task.id).await;

        if task.session_id.is_none() {
            task.session_id = payload.session_id.clone();
        }
        task.usage.input_tokens += payload.input_tokens;
        task.usage.output_tokens += payload.output_tokens;
        task.usage.estimated_cost += payload.estimated_cost;
        task.usage.duration_ms += payload.duration_ms;
        for file in &payload.files_changed {
            task.usage.files_changed.insert(file.clone());
        }
        for command in &payload.commands_run {
            task.usage.record_command(command);
        }
        task.result = Some(payload.result.clone());

        if task.transition(TaskStatus::Completed).is_err() {
            tracing::warn!(task_id = %task.id, status = %task.status, "completion after terminal state");
            return;
        }
        if let Err(err) = self.storage.tasks.update(&task).await {
            tracing::error!(task_id = %task.id, error = %err, "completion persist failed");
            return;
        }

        if let Some(parent_id) = task.parent_task_id.clone() {
            self.driver.aggregate_if_complete(&parent_id).await;
        }

        let thread = task
            .chat
            .thread_ts
            .as_deref()
            .or(task.chat.anchor_ts.as_deref());
        let summary = format!(
            "{}\n\n_{} in / {} out tokens · ${:.4} · {} files changed_",
            payload.result,
            payload.input_tokens,
            payload.output_tokens,
            payload.estimated_cost,
            payload.files_changed.len(),
        );
        let _ = self
            .chat
            .post_message(&task.chat.channel_id, thread, &summary)
            .await;

        // Reaction mirrors status on root tasks only; children report
        // through the parent aggregate.
        if task.parent_task_id.is_none() {
            if let Some(anchor) = &task.chat.anchor_ts {
                self.chat
                    .swap_reaction(
                        &task.chat.channel_id,
                        anchor,
                        reaction::IN_PROGRESS,
                        reaction::SUCCESS,
                    )
                    .await;
            }
        }

        self.handle_attachment_sentinel(&task, &payload.result).await;

        let _ = self
            .storage
            .audit
            .append(
                AuditEntry::new(
                    "task.completed",
                    serde_json::json!({
                        "input_tokens": payload.input_tokens,
                        "output_tokens": payload.output_tokens,
                        "cost": payload.estimated_cost,
                        "duration_ms": payload.duration_ms,
                        "model": payload.model,
                    }),
                )
                .for_task(&task.id)
                .for_agent(agent_id),
            )
            .await;
    }

    /// Terminal failure, or a turn-cap report that the continuation driver
    /// may turn into a re-invocation.
    pub async fn on_error(&self, agent_id: &str, payload: TaskError) {
        let Some(mut task) = self.load(&payload.task_id).await else {
            return;
        };
        if task.is_terminal() {
            return;
        }

        if payload.error.contains(MAX_TURNS_MARKER) {
            self.driver
                .continue_or_cap(&mut task, payload.session_id.as_deref())
                .await;
            return;
        }

        self.fail_task(&mut task, &payload.error, payload.recoverable)
            .await;
        let _ = self
            .storage
            .audit
            .append(
                AuditEntry::new(
                    "task.failed",
                    serde_json::json!({
                        "error": payload.error,
                        "recoverable": payload.recoverable,
                    }),
                )
                .for_task(&task.id)
                .for_agent(agent_id),
            )
            .await;
    }

    /// Worker confirmed an abort. Idempotent with the local cancel state.
    pub async fn on_cancelled(&self, agent_id: &str, payload: TaskCancelled) {
        let Some(mut task) = self.load(&payload.task_id).await else {
            return;
        };
        if task.status == TaskStatus::Cancelled {
            return; // local cancel already applied
        }
        if task.is_terminal() {
            return;
        }
        self.streams.finish(&task.id).await;
        if task.transition(TaskStatus::Cancelled).is_ok() {
            if let Err(err) = self.storage.tasks.update(&task).await {
                tracing::error!(task_id = %task.id, error = %err, "cancel persist failed");
            }
            let thread = task
                .chat
                .thread_ts
                .as_deref()
                .or(task.chat.anchor_ts.as_deref());
            let _ = self
                .chat
                .post_message(
                    &task.chat.channel_id,
                    thread,
                    &format!("Task cancelled: {}", payload.reason),
                )
                .await;
            if let Some(anchor) = &task.chat.anchor_ts {
                self.chat
                    .swap_reaction(
                        &task.chat.channel_id,
                        anchor,
                        reaction::IN_PROGRESS,
                        reaction::CANCELLED,
                    )
                    .await;
            }
            if let Some(parent_id) = task.parent_task_id.clone() {
                self.driver.aggregate_if_complete(&parent_id).await;
            }
            let _ = self
                .storage
                .audit
                .append(
                    AuditEntry::new(
                        "task.cancelled",
                        serde_json::json!({ "reason": payload.reason }),
                    )
                    .for_task(&task.id)
                    .for_agent(agent_id),
                )
                .await;
        }
    }

    async fn fail_task(&self, task: &mut Task, error: &str, recoverable: bool) {
        self.streams.finish(&task.id).await;
        if task.transition(TaskStatus::Failed).is_err() {
            return;
        }
        if let Err(err) = self.storage.tasks.update(task).await {
            tracing::error!(task_id = %task.id, error = %err, "failure persist failed");
            return;
        }

        let thread = task
            .chat
            .thread_ts
            .as_deref()
            .or(task.chat.anchor_ts.as_deref());
        let mut blocks = vec![serde_json::json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("❌ Task failed: {error}") }
        })];
        if recoverable {
            blocks.push(serde_json::json!({
                "type": "actions",
                "elements": [{
                    "type": "button",
                    "text": { "type": "plain_text", "text": "Resubmit" },
                    "action_id": "resubmit_task",
                    "value": task.id,
                }]
            }));
        }
        let _ = self
            .chat
            .post_blocks(&task.chat.channel_id, thread, &blocks)
            .await;

        if task.parent_task_id.is_none() {
            if let Some(anchor) = &task.chat.anchor_ts {
                self.chat
                    .swap_reaction(
                        &task.chat.channel_id,
                        anchor,
                        reaction::IN_PROGRESS,
                        reaction::FAILURE,
                    )
                    .await;
            }
        }
        if let Some(parent_id) = task.parent_task_id.clone() {
            self.driver.aggregate_if_complete(&parent_id).await;
        }
    }

    /// A result line `ATTACH_FILE:<path>|<caption>` asks the fabric to
    /// upload that file into the thread.
    async fn handle_attachment_sentinel(&self, task: &Task, result: &str) {
        for line in result.lines() {
            let Some(rest) = line.trim().strip_prefix(ATTACH_SENTINEL) else {
                continue;
            };
            let (path, caption) = match rest.split_once('|') {
                Some((path, caption)) => (path.trim(), caption.trim()),
                None => (rest.trim(), ""),
            };
            if path.is_empty() {
                continue;
            }
            let thread = task
                .chat
                .thread_ts
                .as_deref()
                .or(task.chat.anchor_ts.as_deref());
            if let Err(err) = self
                .chat
                .upload_file(&task.chat.channel_id, thread, path, caption)
                .await
            {
                tracing::warn!(task_id = %task.id, path, error = %err, "attachment upload failed");
            }
        }
    }
}

impl std::fmt::Debug for LifecycleHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHandlers").finish_non_exhaustive()
    }
}
