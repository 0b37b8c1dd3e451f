//! Command service: entry point for parsed user commands.
//!
//! The chat adapter parses mentions and slash commands, then calls
//! [`CommandService::handle`]. This service resolves the project, builds the
//! execution config from the injected bot registry, and either dispatches
//! the task to an online worker or parks it in the offline queue.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use thiserror::Error;

use crate::chat::{reaction, ChatNotifier};
use crate::config::{DispatchConfig, RateLimitConfig};
use crate::domain::{route_model, ChatAnchor, ModelTier, Project, Task, TaskStatus, TaskUsage};
use crate::queue::OfflineQueue;
use crate::registry::AgentRegistry;
use crate::storage::{AuditEntry, Storage, StorageError};
use crate::workflow::WorkflowDriver;
use foreman_protocol::{Attachment, ChatContext, Frame, Message, TaskCancel, TaskSubmit};

/// Submission failures surfaced back to the chat adapter.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("no project is bound to channel {0}")]
    UnknownChannel(String),

    #[error("unknown bot: {0}")]
    UnknownBot(String),

    #[error("too many commands; try again shortly")]
    RateLimited,

    #[error("task not found: {0}")]
    UnknownTask(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A user command as parsed by the chat adapter.
#[derive(Debug, Clone)]
pub struct UserCommand {
    pub channel_id: String,
    pub thread_ts: Option<String>,
    pub user_id: String,
    /// Message to carry the status reaction.
    pub anchor_ts: Option<String>,
    pub bot_name: String,
    pub command: String,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
}

/// Execution policy a bot contributes to its tasks.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub name: String,
    pub system_prompt: String,
    /// Fixed model override; None routes by tier.
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    /// Budget override; None uses the project default.
    pub max_budget: Option<f64>,
    /// Whether this bot's commands are planned and fanned out as subtasks.
    pub decompose: bool,
    /// Context prepended to every system prompt.
    pub global_context: Option<String>,
}

/// Explicit bot registry injected into the command service.
#[derive(Debug, Default)]
pub struct BotRegistry {
    bots: HashMap<String, BotConfig>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, bot: BotConfig) {
        self.bots.insert(bot.name.clone(), bot);
    }

    pub fn get(&self, name: &str) -> Option<&BotConfig> {
        self.bots.get(name)
    }
}

type UserLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Builds and submits tasks from parsed user commands.
pub struct CommandService {
    storage: Storage,
    agents: Arc<AgentRegistry>,
    queue: Arc<OfflineQueue>,
    chat: Arc<ChatNotifier>,
    bots: Arc<BotRegistry>,
    dispatch: DispatchConfig,
    limiter: UserLimiter,
    driver: OnceLock<Arc<WorkflowDriver>>,
}

impl CommandService {
    pub fn new(
        storage: Storage,
        agents: Arc<AgentRegistry>,
        queue: Arc<OfflineQueue>,
        chat: Arc<ChatNotifier>,
        bots: Arc<BotRegistry>,
        dispatch: DispatchConfig,
        rate_limit: RateLimitConfig,
    ) -> Self {
        let max = NonZeroU32::new(rate_limit.max_requests.max(1)).unwrap_or(NonZeroU32::MIN);
        let period =
            std::time::Duration::from_millis(rate_limit.window_ms.max(1) / u64::from(max.get()));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_minute(max))
            .allow_burst(max);
        Self {
            storage,
            agents,
            queue,
            chat,
            bots,
            dispatch,
            limiter: RateLimiter::keyed(quota),
            driver: OnceLock::new(),
        }
    }

    /// Wire the workflow driver after construction (the driver needs this
    /// service to submit plan tasks and children).
    pub fn bind_driver(&self, driver: Arc<WorkflowDriver>) {
        let _ = self.driver.set(driver);
    }

    /// Entry point for the chat adapter.
    pub async fn handle(&self, command: UserCommand) -> Result<String, SubmitError> {
        if self.limiter.check_key(&command.user_id).is_err() {
            tracing::warn!(user_id = %command.user_id, "command rate limited");
            return Err(SubmitError::RateLimited);
        }

        let project = self
            .storage
            .projects
            .find_by_channel(&command.channel_id)
            .await?
            .ok_or_else(|| SubmitError::UnknownChannel(command.channel_id.clone()))?;
        let bot = self
            .bots
            .get(&command.bot_name)
            .ok_or_else(|| SubmitError::UnknownBot(command.bot_name.clone()))?;

        let task = self.build_task(&command, &project, bot);

        if bot.decompose {
            if let Some(driver) = self.driver.get() {
                return driver.start_decomposition(task, &project).await;
            }
            tracing::error!("decompose requested but no workflow driver bound");
        }
        self.submit_direct(task).await
    }

    /// Build a task from a command, a project, and a bot policy.
    fn build_task(&self, command: &UserCommand, project: &Project, bot: &BotConfig) -> Task {
        let model = bot.model.clone().unwrap_or_else(|| {
            match route_model(&command.command, &command.prompt) {
                // the project default is its standard-tier choice
                ModelTier::Standard if !project.default_model.is_empty() => {
                    project.default_model.clone()
                }
                tier => tier.default_model().to_string(),
            }
        });

        let mut system_prompt = String::new();
        if let Some(context) = &bot.global_context {
            system_prompt.push_str(context);
            system_prompt.push_str("\n\n");
        }
        system_prompt.push_str(&bot.system_prompt);

        let mut prompt = command.prompt.clone();
        if !command.attachments.is_empty() {
            prompt.push_str("\n\nAttached files:");
            for attachment in &command.attachments {
                prompt.push_str(&format!("\n- {} ({})", attachment.name, attachment.url));
            }
        }

        let now = Utc::now();
        Task {
            id: Task::new_id(),
            project_id: project.id.clone(),
            agent_id: None,
            bot_name: bot.name.clone(),
            command: command.command.clone(),
            origin_command: None,
            prompt,
            system_prompt,
            model,
            max_budget: bot.max_budget.unwrap_or(project.default_budget),
            allowed_tools: bot.allowed_tools.clone(),
            parent_task_id: None,
            chat: ChatAnchor {
                channel_id: command.channel_id.clone(),
                thread_ts: command.thread_ts.clone(),
                user_id: command.user_id.clone(),
                anchor_ts: command.anchor_ts.clone(),
            },
            status: TaskStatus::Pending,
            session_id: None,
            usage: TaskUsage::default(),
            result: None,
            continuations: 0,
            max_continuations: self.dispatch.max_continuations,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Persist a task and dispatch it: immediate send when a worker is
    /// online, offline queue otherwise.
    pub async fn submit_direct(&self, mut task: Task) -> Result<String, SubmitError> {
        let project = self
            .storage
            .projects
            .get(&task.project_id)
            .await?
            .ok_or_else(|| SubmitError::UnknownChannel(task.project_id.clone()))?;

        self.storage.tasks.create(&task).await?;

        let submit = build_submit(&task, &project);
        let target = self
            .agents
            .resolve(project.preferred_agent_id.as_deref());

        let sent = match &target {
            Some(agent_id) => {
                let frame = Frame::new(&Message::TaskSubmit(submit.clone()))
                    .map_err(|e| StorageError::Corrupt(e.to_string()))?;
                self.agents.send(agent_id, &frame)
            }
            None => false,
        };

        if sent {
            task.agent_id = target;
            self.storage.tasks.update(&task).await?;
            if let Some(anchor) = &task.chat.anchor_ts {
                let _ = self
                    .chat
                    .add_reaction(&task.chat.channel_id, anchor, reaction::IN_PROGRESS)
                    .await;
            }
            tracing::info!(task_id = %task.id, agent_id = ?task.agent_id, "task dispatched");
        } else {
            let owed_to = project
                .preferred_agent_id
                .clone()
                .unwrap_or_else(|| "any".to_string());
            self.queue
                .enqueue(&owed_to, &Message::TaskSubmit(submit))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            task.transition(TaskStatus::Queued).ok();
            self.storage.tasks.update(&task).await?;
            if let Some(anchor) = &task.chat.anchor_ts {
                let _ = self
                    .chat
                    .add_reaction(&task.chat.channel_id, anchor, reaction::QUEUED)
                    .await;
            }
            tracing::info!(task_id = %task.id, "no worker online, task queued");
        }

        let _ = self
            .storage
            .audit
            .append(
                AuditEntry::new(
                    "task.submitted",
                    serde_json::json!({ "command": task.command, "status": task.status }),
                )
                .for_task(&task.id),
            )
            .await;
        Ok(task.id)
    }

    /// Clone a task under a fresh id and dispatch the clone.
    pub async fn resubmit(&self, task_id: &str) -> Result<String, SubmitError> {
        let original = self
            .storage
            .tasks
            .get(task_id)
            .await?
            .ok_or_else(|| SubmitError::UnknownTask(task_id.to_string()))?;

        let now = Utc::now();
        let clone = Task {
            id: Task::new_id(),
            agent_id: None,
            status: TaskStatus::Pending,
            session_id: None,
            usage: TaskUsage::default(),
            result: None,
            continuations: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            ..original
        };
        self.submit_direct(clone).await
    }

    /// Cancel a task and its children. The cancel frame is broadcast to all
    /// online workers; whoever owns the task honors it via its abort handle.
    pub async fn cancel(&self, task_id: &str, reason: &str) -> Result<(), SubmitError> {
        let frame = Frame::new(&Message::TaskCancel(TaskCancel {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        }))
        .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        let receivers = self.agents.broadcast(&frame);
        tracing::info!(task_id, receivers, "cancel broadcast");

        let Some(task) = self.storage.tasks.get(task_id).await? else {
            return Err(SubmitError::UnknownTask(task_id.to_string()));
        };

        let mut targets = vec![task.clone()];
        targets.extend(self.storage.tasks.find_by_parent(task_id).await?);

        for mut target in targets {
            if target.is_terminal() {
                continue;
            }
            let prior = target.status;
            if target.transition(TaskStatus::Cancelled).is_ok() {
                self.storage.tasks.update(&target).await?;
                if let Some(anchor) = &target.chat.anchor_ts {
                    let from = if prior == TaskStatus::Queued {
                        reaction::QUEUED
                    } else {
                        reaction::IN_PROGRESS
                    };
                    self.chat
                        .swap_reaction(
                            &target.chat.channel_id,
                            anchor,
                            from,
                            reaction::CANCELLED,
                        )
                        .await;
                }
                let _ = self
                    .storage
                    .audit
                    .append(
                        AuditEntry::new("task.cancelled", serde_json::json!({ "reason": reason }))
                            .for_task(&target.id),
                    )
                    .await;
            }
        }
        Ok(())
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl std::fmt::Debug for CommandService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandService")
            .field("dispatch", &self.dispatch)
            .finish_non_exhaustive()
    }
}

/// Build the wire submit for a task.
pub fn build_submit(task: &Task, project: &Project) -> TaskSubmit {
    TaskSubmit {
        task_id: task.id.clone(),
        project_id: task.project_id.clone(),
        bot_name: task.bot_name.clone(),
        command: task.command.clone(),
        prompt: task.prompt.clone(),
        system_prompt: task.system_prompt.clone(),
        local_path: project.local_path.clone(),
        model: task.model.clone(),
        max_budget: task.max_budget,
        allowed_tools: task.allowed_tools.clone(),
        resume_session_id: task.session_id.clone().filter(|_| task.continuations > 0),
        max_continuations: Some(task.max_continuations),
        parent_task_id: task.parent_task_id.clone(),
        attachments: None,
        slack_context: ChatContext {
            channel_id: task.chat.channel_id.clone(),
            thread_ts: task.chat.thread_ts.clone(),
            user_id: task.chat.user_id.clone(),
        },
    }
}
