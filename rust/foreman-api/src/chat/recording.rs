//! In-process chat sink recording every call, for tests and embedded runs.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{ChatClient, ChatError};

/// A posted or edited message as the recording sees it.
#[derive(Debug, Clone)]
pub struct RecordedMessage {
    pub ts: String,
    pub channel: String,
    pub thread_ts: Option<String>,
    pub text: String,
    /// Edit history, oldest first; the current text is the last entry.
    pub edits: Vec<String>,
}

/// Chat client that records instead of sending.
#[derive(Default)]
pub struct RecordingChat {
    state: Mutex<RecordingState>,
}

#[derive(Default)]
struct RecordingState {
    next_ts: u64,
    messages: Vec<RecordedMessage>,
    /// (channel, ts) -> reaction names currently applied.
    reactions: HashMap<(String, String), Vec<String>>,
    uploads: Vec<(String, String)>,
}

impl RecordingChat {
    pub fn messages(&self) -> Vec<RecordedMessage> {
        self.state.lock().messages.clone()
    }

    /// Current reactions on a message.
    pub fn reactions(&self, channel: &str, ts: &str) -> Vec<String> {
        self.state
            .lock()
            .reactions
            .get(&(channel.to_string(), ts.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn uploads(&self) -> Vec<(String, String)> {
        self.state.lock().uploads.clone()
    }

    /// Final text of the message with the given ts, if any.
    pub fn text_of(&self, ts: &str) -> Option<String> {
        self.state
            .lock()
            .messages
            .iter()
            .find(|m| m.ts == ts)
            .map(|m| m.text.clone())
    }
}

#[async_trait]
impl ChatClient for RecordingChat {
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<String, ChatError> {
        let mut state = self.state.lock();
        state.next_ts += 1;
        let ts = format!("1700000000.{:06}", state.next_ts);
        state.messages.push(RecordedMessage {
            ts: ts.clone(),
            channel: channel.to_string(),
            thread_ts: thread_ts.map(String::from),
            text: text.to_string(),
            edits: vec![text.to_string()],
        });
        Ok(ts)
    }

    async fn post_blocks(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        blocks: &[serde_json::Value],
    ) -> Result<String, ChatError> {
        let rendered = serde_json::to_string(blocks).unwrap_or_default();
        self.post_message(channel, thread_ts, &rendered).await
    }

    async fn update_message(&self, _channel: &str, ts: &str, text: &str) -> Result<(), ChatError> {
        let mut state = self.state.lock();
        match state.messages.iter_mut().find(|m| m.ts == ts) {
            Some(message) => {
                message.text = text.to_string();
                message.edits.push(text.to_string());
                Ok(())
            }
            None => Err(ChatError::Permanent(format!("message_not_found: {ts}"))),
        }
    }

    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError> {
        let mut state = self.state.lock();
        let names = state
            .reactions
            .entry((channel.to_string(), ts.to_string()))
            .or_default();
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        Ok(())
    }

    async fn remove_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError> {
        let mut state = self.state.lock();
        if let Some(names) = state
            .reactions
            .get_mut(&(channel.to_string(), ts.to_string()))
        {
            names.retain(|n| n != name);
        }
        Ok(())
    }

    async fn upload_file(
        &self,
        _channel: &str,
        _thread_ts: Option<&str>,
        path: &str,
        caption: &str,
    ) -> Result<(), ChatError> {
        self.state
            .lock()
            .uploads
            .push((path.to_string(), caption.to_string()));
        Ok(())
    }

    async fn open_modal(
        &self,
        _trigger_id: &str,
        _view: serde_json::Value,
    ) -> Result<(), ChatError> {
        Ok(())
    }
}
