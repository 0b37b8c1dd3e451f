//! Chat collaborator contract.
//!
//! The fabric never talks to a chat platform directly; it goes through
//! [`ChatClient`], whose failures are classified so the retry wrapper can
//! decide what to do without inspecting string codes.

pub mod http;
pub mod recording;
pub mod retry;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use retry::{ChatNotifier, FailedNotification, RetryPolicy};

/// Reaction glyphs mirroring task status on the anchor message.
pub mod reaction {
    pub const QUEUED: &str = "inbox_tray";
    pub const IN_PROGRESS: &str = "hourglass_flowing_sand";
    pub const SUCCESS: &str = "white_check_mark";
    pub const FAILURE: &str = "x";
    pub const CANCELLED: &str = "octagonal_sign";
}

/// Classified chat failure.
#[derive(Debug, Clone, Error)]
pub enum ChatError {
    /// The platform asked us to slow down; honor the hint when present.
    #[error("chat API rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Worth retrying: timeouts, 5xx, connection resets.
    #[error("transient chat failure: {0}")]
    Transient(String),

    /// Not worth retrying: bad channel, missing permissions, invalid blocks.
    #[error("permanent chat failure: {0}")]
    Permanent(String),
}

impl ChatError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }
}

/// What the fabric needs from a chat platform. Message ids are the
/// platform's timestamp-style identifiers, returned on post so later edits
/// and reactions can target them.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Post plain text; returns the new message id.
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<String, ChatError>;

    /// Post structured blocks; returns the new message id.
    async fn post_blocks(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        blocks: &[serde_json::Value],
    ) -> Result<String, ChatError>;

    /// Replace the text of an existing message.
    async fn update_message(&self, channel: &str, ts: &str, text: &str) -> Result<(), ChatError>;

    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError>;

    async fn remove_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError>;

    /// Upload a file into a thread with a caption.
    async fn upload_file(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        path: &str,
        caption: &str,
    ) -> Result<(), ChatError>;

    /// Open a modal form for an interactive trigger.
    async fn open_modal(
        &self,
        trigger_id: &str,
        view: serde_json::Value,
    ) -> Result<(), ChatError>;
}
