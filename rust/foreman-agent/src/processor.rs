//! Task queue processor: per-worker concurrency cap, FIFO overflow queue,
//! and cancellation.
//!
//! Tasks within the same project may run in parallel; the only cap is the
//! per-worker `max_concurrent`. Each active task holds an abort handle (the
//! spawned run's join handle); aborting it kills the engine subprocess.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{AgentError, AgentResult};
use crate::executor::{EngineError, ExecutionEngine, ExecutionEvent};
use crate::monitor::ResourceMonitor;
use foreman_protocol::{
    Message, TaskCancelled, TaskComplete, TaskError, TaskProgress, TaskStream, TaskSubmit,
};

/// Marker the cloud's continuation driver looks for in error reports.
const MAX_TURNS_ERROR: &str = "error_max_turns";

/// How a submit was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitDisposition {
    /// Started immediately.
    Started,
    /// Parked in the FIFO queue at this position (1-based).
    Queued { position: u32 },
    /// Already known (duplicate submit); nothing new started.
    Duplicate,
}

struct ActiveTask {
    handle: JoinHandle<()>,
    submitted_at: Instant,
}

#[derive(Default)]
struct Inner {
    active: HashMap<String, ActiveTask>,
    queue: VecDeque<TaskSubmit>,
}

/// Per-worker execution queue.
pub struct TaskProcessor {
    engine: Arc<dyn ExecutionEngine>,
    monitor: Arc<ResourceMonitor>,
    /// Worker-to-gateway messages; the client connection drains this.
    outbound: mpsc::UnboundedSender<Message>,
    max_concurrent: usize,
    inner: Mutex<Inner>,
}

impl TaskProcessor {
    pub fn new(
        engine: Arc<dyn ExecutionEngine>,
        monitor: Arc<ResourceMonitor>,
        outbound: mpsc::UnboundedSender<Message>,
        max_concurrent: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            monitor,
            outbound,
            max_concurrent: max_concurrent.max(1),
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Admit a task: start it if capacity allows, queue it otherwise.
    ///
    /// Re-submitting a task id that is already active or queued is a
    /// duplicate, not a second execution.
    pub fn submit(self: &Arc<Self>, task: TaskSubmit) -> AgentResult<SubmitDisposition> {
        if !self.monitor.can_accept_new_tasks() {
            let sample = self.monitor.last();
            return Err(AgentError::ResourceExhausted {
                memory_pct: sample.memory_pct,
                cpu_pct: sample.cpu_pct,
            });
        }

        let mut inner = self.inner.lock();
        if inner.active.contains_key(&task.task_id)
            || inner.queue.iter().any(|t| t.task_id == task.task_id)
        {
            tracing::debug!(task_id = %task.task_id, "duplicate submit ignored");
            return Ok(SubmitDisposition::Duplicate);
        }

        if inner.active.len() < self.max_concurrent {
            self.start_locked(&mut inner, task);
            Ok(SubmitDisposition::Started)
        } else {
            inner.queue.push_back(task);
            Ok(SubmitDisposition::Queued {
                position: inner.queue.len() as u32,
            })
        }
    }

    /// Abort an active task or splice it out of the queue. Sends the
    /// cancellation confirmation either way.
    pub fn cancel(self: &Arc<Self>, task_id: &str, reason: &str) -> bool {
        let mut inner = self.inner.lock();
        if let Some(active) = inner.active.remove(task_id) {
            active.handle.abort();
            tracing::info!(task_id, reason, "active task aborted");
            self.send_cancelled(task_id, reason);
            self.refill_locked(&mut inner);
            return true;
        }
        if let Some(index) = inner.queue.iter().position(|t| t.task_id == task_id) {
            inner.queue.remove(index);
            tracing::info!(task_id, reason, "queued task removed");
            self.send_cancelled(task_id, reason);
            return true;
        }
        false
    }

    /// Shed load under resource pressure: abort the oldest active task, or
    /// drop the oldest queued one when nothing is active.
    pub fn cancel_lowest_priority(self: &Arc<Self>, reason: &str) {
        let victim = {
            let inner = self.inner.lock();
            inner
                .active
                .iter()
                .min_by_key(|(_, active)| active.submitted_at)
                .map(|(task_id, _)| task_id.clone())
        };
        match victim {
            Some(task_id) => {
                self.cancel(&task_id, reason);
            }
            None => {
                let dropped = self.inner.lock().queue.pop_front();
                if let Some(task) = dropped {
                    tracing::warn!(task_id = %task.task_id, reason, "queued task dropped");
                    self.send_cancelled(&task.task_id, reason);
                }
            }
        }
    }

    /// Ids of currently executing tasks (heartbeat payload).
    pub fn active_ids(&self) -> Vec<String> {
        self.inner.lock().active.keys().cloned().collect()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Abort everything (graceful shutdown).
    pub fn abort_all(self: &Arc<Self>, reason: &str) {
        let task_ids: Vec<String> = self.inner.lock().active.keys().cloned().collect();
        for task_id in task_ids {
            self.cancel(&task_id, reason);
        }
        let queued: Vec<TaskSubmit> = self.inner.lock().queue.drain(..).collect();
        for task in queued {
            self.send_cancelled(&task.task_id, reason);
        }
    }

    fn start_locked(self: &Arc<Self>, inner: &mut Inner, task: TaskSubmit) {
        let task_id = task.task_id.clone();
        let processor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            processor.run_task(task).await;
        });
        inner.active.insert(
            task_id,
            ActiveTask {
                handle,
                submitted_at: Instant::now(),
            },
        );
    }

    fn refill_locked(self: &Arc<Self>, inner: &mut Inner) {
        while inner.active.len() < self.max_concurrent {
            let Some(next) = inner.queue.pop_front() else {
                break;
            };
            tracing::info!(task_id = %next.task_id, "starting queued task");
            self.start_locked(inner, next);
        }
    }

    async fn run_task(self: Arc<Self>, task: TaskSubmit) {
        let task_id = task.task_id.clone();
        let started = Instant::now();
        tracing::info!(task_id = %task_id, command = %task.command, "task started");

        // Forward engine events to the gateway as they arrive.
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let outbound = self.outbound.clone();
        let forward_task_id = task_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                let now = chrono::Utc::now().timestamp_millis();
                let message = match event {
                    ExecutionEvent::Progress { kind, message } => {
                        Message::TaskProgress(TaskProgress {
                            task_id: forward_task_id.clone(),
                            kind,
                            message,
                            timestamp: now,
                        })
                    }
                    ExecutionEvent::Stream { delta } => Message::TaskStream(TaskStream {
                        task_id: forward_task_id.clone(),
                        delta,
                        timestamp: now,
                    }),
                };
                if outbound.send(message).is_err() {
                    break;
                }
            }
        });

        let result = self.engine.run((&task).into(), events_tx).await;
        let _ = forwarder.await;

        let report = match result {
            Ok(outcome) => Message::TaskComplete(TaskComplete {
                task_id: task_id.clone(),
                result: outcome.result,
                session_id: outcome.session_id,
                input_tokens: outcome.input_tokens,
                output_tokens: outcome.output_tokens,
                estimated_cost: outcome.estimated_cost,
                files_changed: outcome.files_changed,
                commands_run: outcome.commands_run,
                duration_ms: started.elapsed().as_millis() as u64,
                continuations: None,
                model: task.model.clone(),
            }),
            Err(EngineError::MaxTurns { session_id }) => Message::TaskError(TaskError {
                task_id: task_id.clone(),
                error: MAX_TURNS_ERROR.to_string(),
                recoverable: true,
                session_id,
            }),
            Err(EngineError::Failed {
                message,
                recoverable,
                session_id,
            }) => Message::TaskError(TaskError {
                task_id: task_id.clone(),
                error: message,
                recoverable,
                session_id,
            }),
            Err(EngineError::Io(err)) => Message::TaskError(TaskError {
                task_id: task_id.clone(),
                error: format!("engine io failure: {err}"),
                recoverable: true,
                session_id: None,
            }),
        };
        if self.outbound.send(report).is_err() {
            tracing::warn!(task_id = %task_id, "terminal report dropped, connection gone");
        }

        self.on_finished(&task_id);
        tracing::info!(
            task_id = %task_id,
            duration_ms = started.elapsed().as_millis() as u64,
            "task finished"
        );
    }

    fn on_finished(self: &Arc<Self>, task_id: &str) {
        let mut inner = self.inner.lock();
        inner.active.remove(task_id);
        self.refill_locked(&mut inner);
    }

    fn send_cancelled(&self, task_id: &str, reason: &str) {
        let _ = self.outbound.send(Message::TaskCancelled(TaskCancelled {
            task_id: task_id.to_string(),
            reason: reason.to_string(),
        }));
    }
}

impl std::fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("TaskProcessor")
            .field("max_concurrent", &self.max_concurrent)
            .field("active", &inner.active.len())
            .field("queued", &inner.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResourceThresholds;
    use crate::executor::{ExecutionOutcome, ExecutionRequest};
    use async_trait::async_trait;
    use foreman_protocol::ChatContext;
    use std::time::Duration;

    /// Engine that waits until told, then succeeds.
    struct SlowEngine {
        hold: Duration,
    }

    #[async_trait]
    impl ExecutionEngine for SlowEngine {
        async fn run(
            &self,
            request: ExecutionRequest,
            events: mpsc::UnboundedSender<ExecutionEvent>,
        ) -> Result<ExecutionOutcome, EngineError> {
            let _ = events.send(ExecutionEvent::Progress {
                kind: foreman_protocol::ProgressKind::Info,
                message: format!("running {}", request.task_id),
            });
            tokio::time::sleep(self.hold).await;
            Ok(ExecutionOutcome {
                result: "done".into(),
                session_id: Some(format!("session-{}", request.task_id)),
                ..ExecutionOutcome::default()
            })
        }
    }

    fn submit(task_id: &str) -> TaskSubmit {
        TaskSubmit {
            task_id: task_id.into(),
            project_id: "p1".into(),
            bot_name: "coder".into(),
            command: "fix".into(),
            prompt: "x".into(),
            system_prompt: String::new(),
            local_path: ".".into(),
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
        }
    }

    fn fixture(
        hold: Duration,
        max_concurrent: usize,
    ) -> (Arc<TaskProcessor>, mpsc::UnboundedReceiver<Message>) {
        let monitor = Arc::new(ResourceMonitor::new(ResourceThresholds::default()));
        let (tx, rx) = mpsc::unbounded_channel();
        let processor = TaskProcessor::new(
            Arc::new(SlowEngine { hold }),
            monitor,
            tx,
            max_concurrent,
        );
        (processor, rx)
    }

    async fn drain_kinds(rx: &mut mpsc::UnboundedReceiver<Message>, mut want: usize) -> Vec<String> {
        let mut kinds = Vec::new();
        while want > 0 {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for worker message")
                .expect("channel closed");
            kinds.push(message.kind().as_str().to_string());
            want -= 1;
        }
        kinds
    }

    #[tokio::test]
    async fn test_submit_starts_within_capacity() {
        let (processor, mut rx) = fixture(Duration::from_millis(10), 2);
        assert_eq!(
            processor.submit(submit("t1")).unwrap(),
            SubmitDisposition::Started
        );
        let kinds = drain_kinds(&mut rx, 2).await;
        assert_eq!(kinds, vec!["task_progress", "task_complete"]);
    }

    #[tokio::test]
    async fn test_overflow_queues_then_refills() {
        let (processor, mut rx) = fixture(Duration::from_millis(50), 1);
        assert_eq!(
            processor.submit(submit("t1")).unwrap(),
            SubmitDisposition::Started
        );
        assert_eq!(
            processor.submit(submit("t2")).unwrap(),
            SubmitDisposition::Queued { position: 1 }
        );
        assert_eq!(processor.queued_len(), 1);

        // both eventually complete: 2 progress + 2 complete
        let kinds = drain_kinds(&mut rx, 4).await;
        assert_eq!(
            kinds.iter().filter(|k| *k == "task_complete").count(),
            2
        );
        assert_eq!(processor.queued_len(), 0);
        assert!(processor.active_ids().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_not_restarted() {
        let (processor, _rx) = fixture(Duration::from_millis(100), 1);
        processor.submit(submit("t1")).unwrap();
        assert_eq!(
            processor.submit(submit("t1")).unwrap(),
            SubmitDisposition::Duplicate
        );
        assert_eq!(processor.active_ids(), vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_active_task_sends_confirmation() {
        let (processor, mut rx) = fixture(Duration::from_secs(60), 1);
        processor.submit(submit("t1")).unwrap();
        // skip the progress event
        let _ = drain_kinds(&mut rx, 1).await;

        assert!(processor.cancel("t1", "user request"));
        let kinds = drain_kinds(&mut rx, 1).await;
        assert_eq!(kinds, vec!["task_cancelled"]);
        assert!(processor.active_ids().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_queued_task_splices_it_out() {
        let (processor, _rx) = fixture(Duration::from_secs(60), 1);
        processor.submit(submit("t1")).unwrap();
        processor.submit(submit("t2")).unwrap();
        assert!(processor.cancel("t2", "user request"));
        assert_eq!(processor.queued_len(), 0);
        // t1 still running
        assert_eq!(processor.active_ids(), vec!["t1".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_lowest_priority_picks_oldest_active() {
        let (processor, _rx) = fixture(Duration::from_secs(60), 2);
        processor.submit(submit("old")).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        processor.submit(submit("new")).unwrap();

        processor.cancel_lowest_priority("pressure");
        assert_eq!(processor.active_ids(), vec!["new".to_string()]);
    }

    #[tokio::test]
    async fn test_resource_exhaustion_rejects_submit() {
        // zero thresholds: every reading is at least critical
        let monitor = Arc::new(ResourceMonitor::new(ResourceThresholds {
            max_memory_pct: 0.0,
            max_cpu_pct: 0.0,
            health_check_interval_ms: 15_000,
        }));
        let (tx, _rx) = mpsc::unbounded_channel();
        let processor =
            TaskProcessor::new(Arc::new(SlowEngine { hold: Duration::ZERO }), monitor, tx, 1);
        assert!(matches!(
            processor.submit(submit("t1")),
            Err(AgentError::ResourceExhausted { .. })
        ));
    }
}
