//! Stream accumulator: coalesces per-task progress and delta events into one
//! evolving chat message instead of one message per event.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::chat::ChatNotifier;
use crate::domain::Task;

/// Throttle settings for delta-driven edits. An edit fires only once both
/// gates allow it, so the stricter of the two bounds the edit rate.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Edit at most every this many deltas.
    pub edit_every_deltas: usize,
    /// And no more often than this.
    pub edit_min_interval: Duration,
    /// Keep at most this many trailing chars of buffered text in the chat
    /// message.
    pub text_tail_chars: usize,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            edit_every_deltas: 10,
            edit_min_interval: Duration::from_millis(1500),
            text_tail_chars: 3000,
        }
    }
}

struct Tracker {
    prompt: String,
    channel_id: String,
    thread_ts: Option<String>,
    steps: Vec<String>,
    text_buffer: String,
    /// Chat id of the evolving progress message; None until first post.
    progress_ts: Option<String>,
    deltas_since_edit: usize,
    last_edit: Instant,
}

impl Tracker {
    fn for_task(task: &Task) -> Self {
        Self {
            prompt: task.prompt.clone(),
            channel_id: task.chat.channel_id.clone(),
            thread_ts: task
                .chat
                .thread_ts
                .clone()
                .or_else(|| task.chat.anchor_ts.clone()),
            steps: Vec::new(),
            text_buffer: String::new(),
            progress_ts: None,
            deltas_since_edit: 0,
            last_edit: Instant::now(),
        }
    }

    fn render(&self, tail_chars: usize) -> String {
        let mut out = format!("*{}*", self.prompt);
        for step in &self.steps {
            out.push_str("\n• ");
            out.push_str(step);
        }
        if !self.text_buffer.is_empty() {
            let tail: String = if self.text_buffer.chars().count() > tail_chars {
                let skip = self.text_buffer.chars().count() - tail_chars;
                self.text_buffer.chars().skip(skip).collect()
            } else {
                self.text_buffer.clone()
            };
            out.push_str("\n\n");
            out.push_str(&tail);
        }
        out
    }
}

/// Per-task trackers, created on the first progress or stream event and
/// destroyed on the terminal event. Chat edits for a given task happen in
/// receipt order; the tracker map lock is held across the edit so a slow
/// chat call cannot reorder them.
pub struct StreamAccumulator {
    chat: Arc<ChatNotifier>,
    settings: StreamSettings,
    trackers: Mutex<HashMap<String, Tracker>>,
}

impl StreamAccumulator {
    pub fn new(chat: Arc<ChatNotifier>, settings: StreamSettings) -> Self {
        Self {
            chat,
            settings,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Record an execution step and create or edit the progress message.
    pub async fn on_progress(&self, task: &Task, step: String) {
        let mut trackers = self.trackers.lock().await;
        let tracker = trackers
            .entry(task.id.clone())
            .or_insert_with(|| Tracker::for_task(task));
        tracker.steps.push(step);
        let text = tracker.render(self.settings.text_tail_chars);
        self.post_or_edit(tracker, &text).await;
        tracker.last_edit = Instant::now();
        tracker.deltas_since_edit = 0;
    }

    /// Buffer an output delta; edits are throttled.
    pub async fn on_stream(&self, task: &Task, delta: &str) {
        let mut trackers = self.trackers.lock().await;
        let tracker = trackers
            .entry(task.id.clone())
            .or_insert_with(|| Tracker::for_task(task));
        tracker.text_buffer.push_str(delta);
        tracker.deltas_since_edit += 1;

        let due = tracker.deltas_since_edit >= self.settings.edit_every_deltas
            && tracker.last_edit.elapsed() >= self.settings.edit_min_interval;
        if due {
            let text = tracker.render(self.settings.text_tail_chars);
            self.post_or_edit(tracker, &text).await;
            tracker.last_edit = Instant::now();
            tracker.deltas_since_edit = 0;
        }
    }

    /// Terminal event: flush whatever is buffered and drop the tracker.
    pub async fn finish(&self, task_id: &str) {
        let mut trackers = self.trackers.lock().await;
        if let Some(tracker) = trackers.remove(task_id) {
            if tracker.deltas_since_edit > 0 || tracker.progress_ts.is_none() {
                let text = tracker.render(self.settings.text_tail_chars);
                self.post_or_edit_final(&tracker, &text).await;
            }
        }
    }

    /// Number of live trackers (operator surface).
    pub async fn active(&self) -> usize {
        self.trackers.lock().await.len()
    }

    async fn post_or_edit(&self, tracker: &mut Tracker, text: &str) {
        match &tracker.progress_ts {
            Some(ts) => {
                let _ = self
                    .chat
                    .update_message(&tracker.channel_id, ts, text)
                    .await;
            }
            None => {
                if let Ok(ts) = self
                    .chat
                    .post_message(&tracker.channel_id, tracker.thread_ts.as_deref(), text)
                    .await
                {
                    tracker.progress_ts = Some(ts);
                }
            }
        }
    }

    async fn post_or_edit_final(&self, tracker: &Tracker, text: &str) {
        match &tracker.progress_ts {
            Some(ts) => {
                let _ = self
                    .chat
                    .update_message(&tracker.channel_id, ts, text)
                    .await;
            }
            None => {
                let _ = self
                    .chat
                    .post_message(&tracker.channel_id, tracker.thread_ts.as_deref(), text)
                    .await;
            }
        }
    }
}

impl std::fmt::Debug for StreamAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAccumulator")
            .field("settings", &self.settings)
            .finish()
    }
}
