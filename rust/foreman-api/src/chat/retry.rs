//! Retry wrapper around the chat client.
//!
//! Exponential backoff with jitter, honoring rate-limit retry-after hints.
//! Once the retry budget is spent the notification lands in a bounded
//! best-effort buffer so an operator can inspect what was dropped.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;

use super::{ChatClient, ChatError};

/// Backoff parameters for chat calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given retry attempt (0-based), with jitter.
    fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let capped = exp.min(self.max_delay);
        let jitter = rand::rng().random_range(0..=capped.as_millis() as u64 / 4);
        capped + Duration::from_millis(jitter)
    }
}

/// A notification that exhausted its retry budget.
#[derive(Debug, Clone)]
pub struct FailedNotification {
    pub operation: String,
    pub channel: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

const FAILED_BUFFER_CAP: usize = 256;

/// Chat client wrapper applying the retry policy to every call.
pub struct ChatNotifier {
    client: Arc<dyn ChatClient>,
    policy: RetryPolicy,
    failed: Mutex<VecDeque<FailedNotification>>,
}

impl ChatNotifier {
    pub fn new(client: Arc<dyn ChatClient>, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            failed: Mutex::new(VecDeque::new()),
        }
    }

    /// Drain the failed-notification buffer (operator surface).
    pub fn take_failed(&self) -> Vec<FailedNotification> {
        self.failed.lock().drain(..).collect()
    }

    async fn retry<T, F, Fut>(&self, operation: &str, channel: &str, f: F) -> Result<T, ChatError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ChatError>>,
    {
        let mut attempt = 0u32;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < self.policy.max_attempts => {
                    let hint = match &err {
                        ChatError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let delay = self.policy.delay_for(attempt, hint);
                    tracing::warn!(
                        operation,
                        channel,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "chat call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::error!(operation, channel, error = %err, "chat call dropped");
                    let mut failed = self.failed.lock();
                    if failed.len() >= FAILED_BUFFER_CAP {
                        failed.pop_front();
                    }
                    failed.push_back(FailedNotification {
                        operation: operation.to_string(),
                        channel: channel.to_string(),
                        error: err.to_string(),
                        at: Utc::now(),
                    });
                    return Err(err);
                }
            }
        }
    }

    pub async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<String, ChatError> {
        self.retry("post_message", channel, || {
            self.client.post_message(channel, thread_ts, text)
        })
        .await
    }

    pub async fn post_blocks(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        blocks: &[serde_json::Value],
    ) -> Result<String, ChatError> {
        self.retry("post_blocks", channel, || {
            self.client.post_blocks(channel, thread_ts, blocks)
        })
        .await
    }

    pub async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        text: &str,
    ) -> Result<(), ChatError> {
        self.retry("update_message", channel, || {
            self.client.update_message(channel, ts, text)
        })
        .await
    }

    pub async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError> {
        self.retry("add_reaction", channel, || {
            self.client.add_reaction(channel, ts, name)
        })
        .await
    }

    pub async fn remove_reaction(
        &self,
        channel: &str,
        ts: &str,
        name: &str,
    ) -> Result<(), ChatError> {
        self.retry("remove_reaction", channel, || {
            self.client.remove_reaction(channel, ts, name)
        })
        .await
    }

    /// Swap the status reaction on an anchor message. Best effort: a failed
    /// removal does not block adding the new glyph.
    pub async fn swap_reaction(&self, channel: &str, ts: &str, from: &str, to: &str) {
        let _ = self.remove_reaction(channel, ts, from).await;
        let _ = self.add_reaction(channel, ts, to).await;
    }

    pub async fn upload_file(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        path: &str,
        caption: &str,
    ) -> Result<(), ChatError> {
        self.retry("upload_file", channel, || {
            self.client.upload_file(channel, thread_ts, path, caption)
        })
        .await
    }
}

impl std::fmt::Debug for ChatNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatNotifier")
            .field("policy", &self.policy)
            .field("failed", &self.failed.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::recording::RecordingChat;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyChat {
        inner: RecordingChat,
        failures_before_success: AtomicU32,
        error: ChatError,
    }

    #[async_trait::async_trait]
    impl ChatClient for FlakyChat {
        async fn post_message(
            &self,
            channel: &str,
            thread_ts: Option<&str>,
            text: &str,
        ) -> Result<String, ChatError> {
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            self.inner.post_message(channel, thread_ts, text).await
        }

        async fn post_blocks(
            &self,
            channel: &str,
            thread_ts: Option<&str>,
            blocks: &[serde_json::Value],
        ) -> Result<String, ChatError> {
            self.inner.post_blocks(channel, thread_ts, blocks).await
        }

        async fn update_message(
            &self,
            channel: &str,
            ts: &str,
            text: &str,
        ) -> Result<(), ChatError> {
            self.inner.update_message(channel, ts, text).await
        }

        async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError> {
            self.inner.add_reaction(channel, ts, name).await
        }

        async fn remove_reaction(
            &self,
            channel: &str,
            ts: &str,
            name: &str,
        ) -> Result<(), ChatError> {
            self.inner.remove_reaction(channel, ts, name).await
        }

        async fn upload_file(
            &self,
            channel: &str,
            thread_ts: Option<&str>,
            path: &str,
            caption: &str,
        ) -> Result<(), ChatError> {
            self.inner.upload_file(channel, thread_ts, path, caption).await
        }

        async fn open_modal(
            &self,
            trigger_id: &str,
            view: serde_json::Value,
        ) -> Result<(), ChatError> {
            self.inner.open_modal(trigger_id, view).await
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let flaky = Arc::new(FlakyChat {
            inner: RecordingChat::default(),
            failures_before_success: AtomicU32::new(2),
            error: ChatError::Transient("503".into()),
        });
        let notifier = ChatNotifier::new(flaky, fast_policy());
        let ts = notifier.post_message("C1", None, "hi").await.unwrap();
        assert!(!ts.is_empty());
        assert!(notifier.take_failed().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let flaky = Arc::new(FlakyChat {
            inner: RecordingChat::default(),
            failures_before_success: AtomicU32::new(99),
            error: ChatError::Permanent("channel_not_found".into()),
        });
        let notifier = ChatNotifier::new(flaky.clone(), fast_policy());
        assert!(notifier.post_message("C1", None, "hi").await.is_err());
        // one original call, no retries
        assert_eq!(flaky.failures_before_success.load(Ordering::SeqCst), 98);
        assert_eq!(notifier.take_failed().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_budget_lands_in_failed_buffer() {
        let flaky = Arc::new(FlakyChat {
            inner: RecordingChat::default(),
            failures_before_success: AtomicU32::new(99),
            error: ChatError::Transient("timeout".into()),
        });
        let notifier = ChatNotifier::new(flaky, fast_policy());
        assert!(notifier.post_message("C1", None, "hi").await.is_err());
        let failed = notifier.take_failed();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].operation, "post_message");
    }
}
