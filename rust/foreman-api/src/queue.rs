//! Offline queue: at-least-once delivery of outbound messages across worker
//! disconnections.
//!
//! Messages owed to an offline worker are persisted with a TTL and replayed
//! when any worker reconnects, either in parallel batches (default) or
//! strictly in order (opt-in). Downstream handlers are keyed by task id and
//! idempotent, which is what makes at-least-once safe.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::chat::{reaction, ChatNotifier};
use crate::config::OfflineQueueConfig;
use crate::domain::TaskStatus;
use crate::registry::{AgentRegistry, RegistryEvent};
use crate::storage::{QueuedMessage, Storage, StorageError};
use foreman_protocol::{Frame, Message, MessageKind};

/// Delivery failures.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("no worker available for {agent_id}")]
    NoWorker { agent_id: String },

    #[error("send to {agent_id} failed after {attempts} attempts")]
    SendFailed { agent_id: String, attempts: u32 },

    #[error("queued payload no longer decodes: {0}")]
    Corrupt(#[from] foreman_protocol::ProtocolError),
}

/// Counters exposed for the operator surface.
#[derive(Debug, Clone, Default)]
pub struct QueueMetrics {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    pub expired: u64,
    pub total_delivery_ms: u64,
}

impl QueueMetrics {
    pub fn avg_delivery_ms(&self) -> f64 {
        if self.delivered == 0 {
            0.0
        } else {
            self.total_delivery_ms as f64 / self.delivered as f64
        }
    }
}

/// Outcome of one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Durable buffer of messages owed to workers.
pub struct OfflineQueue {
    storage: Storage,
    registry: Arc<AgentRegistry>,
    chat: Arc<ChatNotifier>,
    config: OfflineQueueConfig,
    metrics: Mutex<QueueMetrics>,
    /// Serializes drain cycles; a reconnect racing the ticker must not
    /// double-deliver within the same cycle.
    drain_gate: tokio::sync::Mutex<()>,
}

impl OfflineQueue {
    pub fn new(
        storage: Storage,
        registry: Arc<AgentRegistry>,
        chat: Arc<ChatNotifier>,
        config: OfflineQueueConfig,
    ) -> Self {
        Self {
            storage,
            registry,
            chat,
            config,
            metrics: Mutex::new(QueueMetrics::default()),
            drain_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.metrics.lock().clone()
    }

    /// Persist a message owed to `agent_id`.
    pub async fn enqueue(&self, agent_id: &str, message: &Message) -> Result<i64, QueueError> {
        let expires_at = Utc::now() + self.config.ttl();
        let serial = self
            .storage
            .offline
            .enqueue(agent_id, message.kind(), message.to_payload()?, expires_at)
            .await?;
        self.metrics.lock().enqueued += 1;
        tracing::info!(
            agent_id,
            serial,
            kind = %message.kind(),
            "message buffered for offline worker"
        );
        Ok(serial)
    }

    /// Attempt delivery of every pending entry.
    pub async fn drain_all(&self) -> DrainSummary {
        let _gate = self.drain_gate.lock().await;

        let pending = match self.storage.offline.load_pending(Utc::now()).await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::error!(error = %err, "failed to load offline queue");
                return DrainSummary::default();
            }
        };
        if pending.is_empty() {
            return DrainSummary::default();
        }

        let mut summary = DrainSummary {
            attempted: pending.len(),
            ..DrainSummary::default()
        };
        tracing::info!(pending = pending.len(), "draining offline queue");

        if self.config.preserve_order {
            // Strict ordering: one at a time, stop at the first failure.
            for entry in &pending {
                match self.deliver(entry).await {
                    Ok(()) => summary.delivered += 1,
                    Err(err) => {
                        tracing::warn!(serial = entry.serial, error = %err, "ordered drain halted");
                        summary.failed += 1;
                        break;
                    }
                }
            }
        } else {
            for batch in pending.chunks(self.config.max_concurrent_deliveries.max(1)) {
                let results =
                    futures::future::join_all(batch.iter().map(|entry| self.deliver(entry))).await;
                for (entry, result) in batch.iter().zip(results) {
                    match result {
                        Ok(()) => summary.delivered += 1,
                        Err(err) => {
                            tracing::warn!(serial = entry.serial, error = %err, "delivery failed");
                            summary.failed += 1;
                        }
                    }
                }
            }
        }
        summary
    }

    /// Deliver one entry with retries and linear backoff. On success the
    /// entry is marked delivered and, for task submissions, the task flips
    /// `queued -> pending` and its anchor reaction follows.
    async fn deliver(&self, entry: &QueuedMessage) -> Result<(), QueueError> {
        let message = Message::from_payload(entry.kind, entry.payload.clone())?;
        let started = std::time::Instant::now();

        let mut attempts = 0u32;
        loop {
            self.storage.offline.record_attempt(entry.serial).await?;
            attempts += 1;

            // Fall back off the original worker when it is gone.
            let target = self.registry.resolve(Some(&entry.agent_id));
            let sent = match &target {
                Some(agent_id) => {
                    let frame = Frame::new(&message)?;
                    let send = async { self.registry.send(agent_id, &frame) };
                    tokio::time::timeout(self.config.delivery_timeout(), send)
                        .await
                        .unwrap_or(false)
                }
                None => false,
            };

            if sent {
                self.storage.offline.mark_delivered(entry.serial).await?;
                {
                    let mut metrics = self.metrics.lock();
                    metrics.delivered += 1;
                    metrics.total_delivery_ms += started.elapsed().as_millis() as u64;
                }
                let agent_id = target.unwrap_or_default();
                tracing::info!(serial = entry.serial, agent_id, "queued message delivered");
                if entry.kind == MessageKind::TaskSubmit {
                    self.after_submit_delivery(&message).await;
                }
                return Ok(());
            }

            if attempts >= self.config.retry_attempts {
                self.metrics.lock().failed += 1;
                return Err(match target {
                    Some(agent_id) => QueueError::SendFailed { agent_id, attempts },
                    None => QueueError::NoWorker {
                        agent_id: entry.agent_id.clone(),
                    },
                });
            }
            tokio::time::sleep(self.config.retry_delay() * attempts).await;
        }
    }

    /// A delivered submit means the task is no longer waiting in the queue:
    /// flip its status and the anchor reaction.
    async fn after_submit_delivery(&self, message: &Message) {
        let Message::TaskSubmit(submit) = message else {
            return;
        };
        let task = match self.storage.tasks.get(&submit.task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                tracing::warn!(task_id = %submit.task_id, "delivered submit for unknown task");
                return;
            }
            Err(err) => {
                tracing::error!(task_id = %submit.task_id, error = %err, "task lookup failed");
                return;
            }
        };
        if task.status != TaskStatus::Queued {
            return;
        }
        let mut task = task;
        if task.transition(TaskStatus::Pending).is_ok() {
            if let Err(err) = self.storage.tasks.update(&task).await {
                tracing::error!(task_id = %task.id, error = %err, "task update failed");
                return;
            }
            if let Some(anchor_ts) = &task.chat.anchor_ts {
                self.chat
                    .swap_reaction(
                        &task.chat.channel_id,
                        anchor_ts,
                        reaction::QUEUED,
                        reaction::IN_PROGRESS,
                    )
                    .await;
            }
        }
    }

    /// Remove entries past their TTL.
    pub async fn clean_expired(&self) -> u64 {
        match self.storage.offline.delete_expired(Utc::now()).await {
            Ok(removed) => {
                if removed > 0 {
                    self.metrics.lock().expired += removed;
                    tracing::info!(removed, "expired offline entries removed");
                }
                removed
            }
            Err(err) => {
                tracing::error!(error = %err, "expiry sweep failed");
                0
            }
        }
    }

    /// Spawn the drain triggers: worker-connected events, a periodic drain
    /// ticker covering anything missed, and the expiry sweep. Handles are
    /// returned so shutdown can abort them.
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let queue = Arc::clone(self);
        let mut events = self.registry.subscribe();
        handles.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let RegistryEvent::Connected { agent_id } = event {
                    tracing::debug!(agent_id, "drain triggered by reconnect");
                    queue.drain_all().await;
                }
            }
        }));

        let queue = Arc::clone(self);
        let drain_interval = self.config.drain_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(drain_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                queue.drain_all().await;
            }
        }));

        let queue = Arc::clone(self);
        let expiry_interval = self.config.drain_interval();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(expiry_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                queue.clean_expired().await;
            }
        }));

        handles
    }
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("config", &self.config)
            .field("metrics", &self.metrics.lock().clone())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::recording::RecordingChat;
    use crate::chat::RetryPolicy;
    use crate::connection::ConnectionHandle;
    use crate::domain::{ChatAnchor, Task, TaskUsage};
    use foreman_protocol::{ChatContext, TaskSubmit};

    fn submit(task_id: &str) -> Message {
        Message::TaskSubmit(TaskSubmit {
            task_id: task_id.into(),
            project_id: "p1".into(),
            bot_name: "coder".into(),
            command: "fix".into(),
            prompt: "review pr #42".into(),
            system_prompt: String::new(),
            local_path: "/srv/app".into(),
            model: "standard-1".into(),
            max_budget: 1.0,
            allowed_tools: vec![],
            resume_session_id: None,
            max_continuations: None,
            parent_task_id: None,
            attachments: None,
            slack_context: ChatContext {
                channel_id: "C1".into(),
                thread_ts: None,
                user_id: "U1".into(),
            },
        })
    }

    fn queued_task(id: &str) -> Task {
        Task {
            id: id.into(),
            project_id: "p1".into(),
            agent_id: Some("w1".into()),
            bot_name: "coder".into(),
            command: "fix".into(),
            origin_command: None,
            prompt: "review pr #42".into(),
            system_prompt: String::new(),
            model: "standard-1".into(),
            max_budget: 1.0,
            allowed_tools: vec![],
            parent_task_id: None,
            chat: ChatAnchor {
                channel_id: "C1".into(),
                thread_ts: None,
                user_id: "U1".into(),
                anchor_ts: Some("100.000001".into()),
            },
            status: TaskStatus::Queued,
            session_id: None,
            usage: TaskUsage::default(),
            result: None,
            continuations: 0,
            max_continuations: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
        }
    }

    fn fixture() -> (Arc<RecordingChat>, Storage, Arc<AgentRegistry>, Arc<OfflineQueue>) {
        let chat = Arc::new(RecordingChat::default());
        let notifier = Arc::new(ChatNotifier::new(chat.clone(), RetryPolicy::default()));
        let storage = Storage::in_memory();
        let registry = Arc::new(AgentRegistry::new());
        let config = OfflineQueueConfig {
            retry_attempts: 2,
            retry_delay_ms: 1,
            ..OfflineQueueConfig::default()
        };
        let queue = Arc::new(OfflineQueue::new(
            storage.clone(),
            registry.clone(),
            notifier,
            config,
        ));
        (chat, storage, registry, queue)
    }

    #[tokio::test]
    async fn test_drain_with_no_workers_fails_without_delivering() {
        let (_chat, _storage, _registry, queue) = fixture();
        queue.enqueue("w1", &submit("t1")).await.unwrap();

        let summary = queue.drain_all().await;
        assert_eq!(summary.attempted, 1);
        assert_eq!(summary.delivered, 0);
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_drain_delivers_and_flips_task_to_pending() {
        let (chat, storage, registry, queue) = fixture();
        storage.tasks.create(&queued_task("t1")).await.unwrap();
        queue.enqueue("w1", &submit("t1")).await.unwrap();

        let (handle, mut rx) = ConnectionHandle::new();
        registry.register("w1", handle);

        let summary = queue.drain_all().await;
        assert_eq!(summary.delivered, 1);

        // the worker received the frame
        assert!(rx.try_recv().is_ok());

        // the task moved out of queued and its reaction flipped
        let task = storage.tasks.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        let reactions = chat.reactions("C1", "100.000001");
        assert!(reactions.contains(&reaction::IN_PROGRESS.to_string()));
        assert!(!reactions.contains(&reaction::QUEUED.to_string()));
    }

    #[tokio::test]
    async fn test_delivered_entries_are_never_resent() {
        let (_chat, storage, registry, queue) = fixture();
        storage.tasks.create(&queued_task("t1")).await.unwrap();
        queue.enqueue("w1", &submit("t1")).await.unwrap();

        let (handle, _rx) = ConnectionHandle::new();
        registry.register("w1", handle);

        assert_eq!(queue.drain_all().await.delivered, 1);
        let again = queue.drain_all().await;
        assert_eq!(again, DrainSummary::default());
        assert_eq!(queue.metrics().delivered, 1);
    }

    #[tokio::test]
    async fn test_delivery_falls_back_to_another_worker() {
        let (_chat, storage, registry, queue) = fixture();
        storage.tasks.create(&queued_task("t1")).await.unwrap();
        queue.enqueue("gone-worker", &submit("t1")).await.unwrap();

        let (handle, mut rx) = ConnectionHandle::new();
        registry.register("other", handle);

        assert_eq!(queue.drain_all().await.delivered, 1);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_expired_entries_are_removed_not_delivered() {
        let (_chat, storage, registry, queue) = fixture();
        // entry already expired
        storage
            .offline
            .enqueue(
                "w1",
                MessageKind::TaskSubmit,
                submit("t1").to_payload().unwrap(),
                Utc::now() - chrono::Duration::seconds(1),
            )
            .await
            .unwrap();

        let (handle, mut rx) = ConnectionHandle::new();
        registry.register("w1", handle);

        assert_eq!(queue.drain_all().await, DrainSummary::default());
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.clean_expired().await, 1);
    }

    #[tokio::test]
    async fn test_ordered_drain_stops_at_first_failure() {
        let (_chat, storage, _registry, queue_parallel) = fixture();
        drop(queue_parallel);
        // rebuild with preserve_order; no workers online so everything fails
        let chat = Arc::new(RecordingChat::default());
        let notifier = Arc::new(ChatNotifier::new(chat, RetryPolicy::default()));
        let registry = Arc::new(AgentRegistry::new());
        let config = OfflineQueueConfig {
            preserve_order: true,
            retry_attempts: 1,
            retry_delay_ms: 1,
            ..OfflineQueueConfig::default()
        };
        let queue = Arc::new(OfflineQueue::new(
            storage.clone(),
            registry,
            notifier,
            config,
        ));
        queue.enqueue("w1", &submit("t1")).await.unwrap();
        queue.enqueue("w1", &submit("t2")).await.unwrap();

        let summary = queue.drain_all().await;
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.failed, 1, "stops at first failure");
        assert_eq!(summary.delivered, 0);
    }
}
