//! Workflow driver: decomposition of complex tasks into planned subtasks,
//! parent aggregation, and the auto-continuation loop for tasks that hit
//! their per-invocation turn cap.

use std::sync::Arc;

use serde::Deserialize;

use crate::chat::{reaction, ChatNotifier};
use crate::commands::{build_submit, BotRegistry, CommandService, SubmitError};
use crate::domain::{Project, Task, TaskStatus};
use crate::registry::AgentRegistry;
use crate::storage::{AuditEntry, Storage};
use foreman_protocol::{Frame, Message, TaskComplete};

/// Distinguished error marker a worker reports when an invocation ended at
/// its turn cap rather than completing.
pub const MAX_TURNS_MARKER: &str = "error_max_turns";

/// Prompt used to re-invoke a capped session.
const CONTINUE_PROMPT: &str = "Continue where you left off.";

/// Tools a planning task may use; planning never writes.
const READ_ONLY_TOOLS: &[&str] = &["read_file", "grep", "list_files", "glob"];

/// One planned subtask parsed from a plan result.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SubtaskSpec {
    pub command: String,
    pub prompt: String,
}

/// Outcome of a continuation decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationOutcome {
    /// The task was re-invoked with its prior session.
    Continued,
    /// The budget is exhausted; the task was failed with a cap notice.
    Capped,
    /// Continuation does not apply (no session, or task cancelled).
    NotApplicable,
}

/// Drives decomposition and continuation on top of the command service.
pub struct WorkflowDriver {
    storage: Storage,
    chat: Arc<ChatNotifier>,
    agents: Arc<AgentRegistry>,
    commands: Arc<CommandService>,
    bots: Arc<BotRegistry>,
}

impl WorkflowDriver {
    pub fn new(
        storage: Storage,
        chat: Arc<ChatNotifier>,
        agents: Arc<AgentRegistry>,
        commands: Arc<CommandService>,
        bots: Arc<BotRegistry>,
    ) -> Self {
        Self {
            storage,
            chat,
            agents,
            commands,
            bots,
        }
    }

    /// Turn a drafted task into a planning parent and submit it.
    ///
    /// The plan runs with read-only tools and no continuation budget: it
    /// must produce its subtask list in a single invocation.
    pub async fn start_decomposition(
        &self,
        mut task: Task,
        _project: &Project,
    ) -> Result<String, SubmitError> {
        task.origin_command = Some(task.command.clone());
        task.command = "decompose".to_string();
        task.allowed_tools = READ_ONLY_TOOLS.iter().map(|s| s.to_string()).collect();
        task.max_continuations = 0;
        tracing::info!(task_id = %task.id, "starting decomposition plan");
        self.commands.submit_direct(task).await
    }

    /// Handle the completion of a planning parent: parse its result into
    /// subtasks and fan them out. The parent stays non-terminal until every
    /// child is terminal.
    pub async fn on_plan_complete(&self, parent: &mut Task, payload: &TaskComplete) {
        parent.result = Some(payload.result.clone());
        if parent.session_id.is_none() {
            parent.session_id = payload.session_id.clone();
        }
        parent.usage.input_tokens += payload.input_tokens;
        parent.usage.output_tokens += payload.output_tokens;
        parent.usage.estimated_cost += payload.estimated_cost;
        parent.usage.duration_ms += payload.duration_ms;
        if let Err(err) = self.storage.tasks.update(parent).await {
            tracing::error!(task_id = %parent.id, error = %err, "plan result persist failed");
            return;
        }

        let mut specs = parse_subtasks(&payload.result);
        if specs.is_empty() {
            tracing::warn!(task_id = %parent.id, "plan yielded no subtasks, falling back to direct run");
            specs = vec![SubtaskSpec {
                command: parent
                    .origin_command
                    .clone()
                    .unwrap_or_else(|| "fix".to_string()),
                prompt: parent.prompt.clone(),
            }];
        }

        self.post_plan_summary(parent, &specs).await;

        // Sequential submission: the children share a workspace; execution
        // parallelism is the worker's call.
        for (index, spec) in specs.iter().enumerate() {
            let child = self.child_task(parent, spec);
            if let Err(err) = self.commands.submit_direct(child).await {
                tracing::error!(
                    task_id = %parent.id,
                    subtask = index,
                    error = %err,
                    "subtask submission failed"
                );
            }
        }
    }

    fn child_task(&self, parent: &Task, spec: &SubtaskSpec) -> Task {
        // Children execute with the bot's real toolset, not the plan's
        // read-only set. The parent's list was overwritten for planning, so
        // re-derive from the bot the task was issued against.
        let allowed_tools = match self.bots.get(&parent.bot_name) {
            Some(bot) => bot.allowed_tools.clone(),
            None => {
                tracing::warn!(
                    bot_name = %parent.bot_name,
                    "bot missing during fan-out, child keeps planning tools"
                );
                parent.allowed_tools.clone()
            }
        };
        let now = chrono::Utc::now();
        Task {
            id: Task::new_id(),
            command: spec.command.clone(),
            origin_command: None,
            prompt: spec.prompt.clone(),
            allowed_tools,
            parent_task_id: Some(parent.id.clone()),
            agent_id: None,
            status: TaskStatus::Pending,
            session_id: None,
            usage: Default::default(),
            result: None,
            continuations: 0,
            max_continuations: parent.max_continuations,
            created_at: now,
            updated_at: now,
            completed_at: None,
            chat: crate::domain::ChatAnchor {
                anchor_ts: None,
                ..parent.chat.clone()
            },
            ..parent.clone()
        }
    }

    async fn post_plan_summary(&self, parent: &Task, specs: &[SubtaskSpec]) {
        let mut blocks = vec![serde_json::json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("Planned {} subtasks:", specs.len()) }
        })];
        for (index, spec) in specs.iter().enumerate() {
            blocks.push(serde_json::json!({
                "type": "section",
                "text": {
                    "type": "mrkdwn",
                    "text": format!("{}. `{}` {}", index + 1, spec.command, spec.prompt)
                }
            }));
        }
        let thread = parent
            .chat
            .thread_ts
            .as_deref()
            .or(parent.chat.anchor_ts.as_deref());
        let _ = self
            .chat
            .post_blocks(&parent.chat.channel_id, thread, &blocks)
            .await;
    }

    /// Called whenever a child reaches a terminal state. When the last
    /// sibling lands, the parent aggregates: usage summed, summary posted,
    /// parent marked completed (all success) or failed (any failure).
    pub async fn aggregate_if_complete(&self, parent_id: &str) {
        let parent = match self.storage.tasks.get(parent_id).await {
            Ok(Some(parent)) => parent,
            Ok(None) => {
                tracing::warn!(parent_id, "aggregation for unknown parent");
                return;
            }
            Err(err) => {
                tracing::error!(parent_id, error = %err, "parent lookup failed");
                return;
            }
        };
        if parent.is_terminal() {
            return;
        }
        match self.storage.tasks.all_subtasks_terminal(parent_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::error!(parent_id, error = %err, "sibling query failed");
                return;
            }
        }

        let children = match self.storage.tasks.find_by_parent(parent_id).await {
            Ok(children) => children,
            Err(err) => {
                tracing::error!(parent_id, error = %err, "children load failed");
                return;
            }
        };

        let mut parent = parent;
        let mut failures = 0usize;
        for child in &children {
            parent.usage.absorb(&child.usage);
            if child.status != TaskStatus::Completed {
                failures += 1;
            }
        }
        let outcome = if failures == 0 {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };

        let mut summary = format!(
            "{} of {} subtasks succeeded · {} in / {} out tokens · ${:.4}",
            children.len() - failures,
            children.len(),
            parent.usage.input_tokens,
            parent.usage.output_tokens,
            parent.usage.estimated_cost,
        );
        for child in &children {
            summary.push_str(&format!(
                "\n{} `{}` {}",
                match child.status {
                    TaskStatus::Completed => "✅",
                    TaskStatus::Cancelled => "🚫",
                    _ => "❌",
                },
                child.command,
                truncate(&child.prompt, 80)
            ));
        }

        let thread = parent
            .chat
            .thread_ts
            .as_deref()
            .or(parent.chat.anchor_ts.as_deref());
        let _ = self
            .chat
            .post_message(&parent.chat.channel_id, thread, &summary)
            .await;

        if parent.transition(outcome).is_ok() {
            if let Err(err) = self.storage.tasks.update(&parent).await {
                tracing::error!(parent_id, error = %err, "parent update failed");
                return;
            }
            if let Some(anchor) = &parent.chat.anchor_ts {
                let glyph = if outcome == TaskStatus::Completed {
                    reaction::SUCCESS
                } else {
                    reaction::FAILURE
                };
                self.chat
                    .swap_reaction(
                        &parent.chat.channel_id,
                        anchor,
                        reaction::IN_PROGRESS,
                        glyph,
                    )
                    .await;
            }
            let _ = self
                .storage
                .audit
                .append(
                    AuditEntry::new(
                        "task.aggregated",
                        serde_json::json!({
                            "children": children.len(),
                            "failures": failures,
                            "outcome": outcome,
                        }),
                    )
                    .for_task(parent_id),
                )
                .await;
        }
    }

    /// Decide what to do with a turn-capped invocation: re-invoke with the
    /// prior session while budget remains, otherwise fail the task with a
    /// cap notice.
    pub async fn continue_or_cap(
        &self,
        task: &mut Task,
        session_id: Option<&str>,
    ) -> ContinuationOutcome {
        if let Some(session) = session_id {
            if task.session_id.is_none() {
                task.session_id = Some(session.to_string());
            }
        }
        if task.status == TaskStatus::Cancelled {
            return ContinuationOutcome::NotApplicable;
        }
        let Some(session) = task.session_id.clone() else {
            return ContinuationOutcome::NotApplicable;
        };

        if task.can_continue() {
            task.continuations += 1;
            if let Err(err) = self.storage.tasks.update(task).await {
                tracing::error!(task_id = %task.id, error = %err, "continuation persist failed");
                return ContinuationOutcome::NotApplicable;
            }

            let project = match self.storage.projects.get(&task.project_id).await {
                Ok(Some(project)) => project,
                _ => return ContinuationOutcome::NotApplicable,
            };
            let mut submit = build_submit(task, &project);
            submit.prompt = CONTINUE_PROMPT.to_string();
            submit.resume_session_id = Some(session);

            let message = Message::TaskSubmit(submit);
            let target = self
                .agents
                .resolve(task.agent_id.as_deref().or(project.preferred_agent_id.as_deref()));
            let sent = match (&target, Frame::new(&message)) {
                (Some(agent_id), Ok(frame)) => self.agents.send(agent_id, &frame),
                _ => false,
            };
            if !sent {
                // Worker dropped between invocations; the queue owns it now.
                let owed_to = target.unwrap_or_else(|| "any".to_string());
                if let Err(err) = self.queue_enqueue(&owed_to, &message).await {
                    tracing::error!(task_id = %task.id, error = %err, "continuation enqueue failed");
                }
            }
            tracing::info!(
                task_id = %task.id,
                continuation = task.continuations,
                of = task.max_continuations,
                "turn cap hit, continuing session"
            );
            return ContinuationOutcome::Continued;
        }

        // Budget exhausted: report the cap and end the task.
        let notice = format!(
            "Reached the turn cap after {} continuations. Partial progress is saved; resume with session `{}`.",
            task.continuations, session
        );
        let thread = task
            .chat
            .thread_ts
            .as_deref()
            .or(task.chat.anchor_ts.as_deref());
        let _ = self
            .chat
            .post_message(&task.chat.channel_id, thread, &notice)
            .await;

        if task.transition(TaskStatus::Failed).is_ok() {
            if let Err(err) = self.storage.tasks.update(task).await {
                tracing::error!(task_id = %task.id, error = %err, "cap persist failed");
            }
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
            let _ = self
                .storage
                .audit
                .append(
                    AuditEntry::new(
                        "task.turn_capped",
                        serde_json::json!({ "continuations": task.continuations }),
                    )
                    .for_task(&task.id),
                )
                .await;
        }
        ContinuationOutcome::Capped
    }

    async fn queue_enqueue(
        &self,
        agent_id: &str,
        message: &Message,
    ) -> Result<(), crate::queue::QueueError> {
        // Continuations reuse the command service's queue through storage:
        // enqueue directly so the retry machinery picks it up on reconnect.
        let expires_at = chrono::Utc::now() + chrono::Duration::hours(24);
        self.storage
            .offline
            .enqueue(agent_id, message.kind(), message.to_payload()?, expires_at)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowDriver").finish_non_exhaustive()
    }
}

/// Parse a plan result into subtask specs.
///
/// The planner is asked for a JSON array of `{command, prompt}` objects; it
/// often wraps the array in prose or a code fence, so parsing scans for the
/// outermost brackets. Anything unparseable yields an empty list and the
/// caller falls back to a single direct submission.
pub fn parse_subtasks(text: &str) -> Vec<SubtaskSpec> {
    let (start, end) = match (text.find('['), text.rfind(']')) {
        (Some(start), Some(end)) if start < end => (start, end),
        _ => return Vec::new(),
    };
    match serde_json::from_str::<Vec<SubtaskSpec>>(&text[start..=end]) {
        Ok(specs) => specs
            .into_iter()
            .filter(|s| !s.prompt.trim().is_empty() && !s.command.trim().is_empty())
            .collect(),
        Err(err) => {
            tracing::warn!(error = %err, "plan result did not parse as subtasks");
            Vec::new()
        }
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head: String = text.chars().take(max).collect();
        format!("{head}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subtasks_plain_array() {
        let text = r#"[{"command":"fix","prompt":"repair the null check"},
                       {"command":"test","prompt":"add regression tests"}]"#;
        let specs = parse_subtasks(text);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].command, "fix");
        assert_eq!(specs[1].command, "test");
    }

    #[test]
    fn test_parse_subtasks_with_surrounding_prose() {
        let text = "Here is the plan:\n```json\n[{\"command\":\"fix\",\"prompt\":\"do it\"}]\n```\nGood luck!";
        let specs = parse_subtasks(text);
        assert_eq!(specs.len(), 1);
    }

    #[test]
    fn test_parse_subtasks_rejects_garbage() {
        assert!(parse_subtasks("no plan here").is_empty());
        assert!(parse_subtasks("[1, 2, 3]").is_empty());
        assert!(parse_subtasks("[").is_empty());
    }

    #[test]
    fn test_parse_subtasks_skips_blank_entries() {
        let text = r#"[{"command":"fix","prompt":""},{"command":"test","prompt":"cover it"}]"#;
        let specs = parse_subtasks(text);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].command, "test");
    }

    #[test]
    fn test_truncate_long_prompts() {
        assert_eq!(truncate("short", 80), "short");
        let long = "y".repeat(100);
        let out = truncate(&long, 80);
        assert!(out.chars().count() <= 81);
        assert!(out.ends_with('…'));
    }
}
