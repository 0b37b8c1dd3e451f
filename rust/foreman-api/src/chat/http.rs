//! HTTP chat client speaking a Slack-style web API.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::{ChatClient, ChatError};

/// Thin reqwest-backed client. Response failures are classified into the
/// chat error taxonomy; the retry wrapper above decides what to do with
/// them.
pub struct HttpChatClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

impl HttpChatClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<ApiResponse, ChatError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), method);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    ChatError::Transient(e.to_string())
                } else {
                    ChatError::Permanent(e.to_string())
                }
            })?;

        if response.status().as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ChatError::RateLimited { retry_after });
        }
        if response.status().is_server_error() {
            return Err(ChatError::Transient(format!(
                "chat API returned {}",
                response.status()
            )));
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| ChatError::Transient(e.to_string()))?;
        if !parsed.ok {
            let code = parsed.error.unwrap_or_else(|| "unknown_error".to_string());
            // The platform reports throttling in-band as well.
            return Err(match code.as_str() {
                "ratelimited" | "rate_limited" => ChatError::RateLimited { retry_after: None },
                "internal_error" | "service_unavailable" => ChatError::Transient(code),
                _ => ChatError::Permanent(code),
            });
        }
        Ok(parsed)
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn post_message(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        text: &str,
    ) -> Result<String, ChatError> {
        let mut body = serde_json::json!({ "channel": channel, "text": text });
        if let Some(ts) = thread_ts {
            body["thread_ts"] = ts.into();
        }
        let response = self.call("chat.postMessage", body).await?;
        response
            .ts
            .ok_or_else(|| ChatError::Permanent("post response missing ts".into()))
    }

    async fn post_blocks(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        blocks: &[serde_json::Value],
    ) -> Result<String, ChatError> {
        let mut body = serde_json::json!({ "channel": channel, "blocks": blocks });
        if let Some(ts) = thread_ts {
            body["thread_ts"] = ts.into();
        }
        let response = self.call("chat.postMessage", body).await?;
        response
            .ts
            .ok_or_else(|| ChatError::Permanent("post response missing ts".into()))
    }

    async fn update_message(&self, channel: &str, ts: &str, text: &str) -> Result<(), ChatError> {
        self.call(
            "chat.update",
            serde_json::json!({ "channel": channel, "ts": ts, "text": text }),
        )
        .await
        .map(|_| ())
    }

    async fn add_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError> {
        match self
            .call(
                "reactions.add",
                serde_json::json!({ "channel": channel, "timestamp": ts, "name": name }),
            )
            .await
        {
            // Already applied is success for our purposes.
            Err(ChatError::Permanent(code)) if code == "already_reacted" => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn remove_reaction(&self, channel: &str, ts: &str, name: &str) -> Result<(), ChatError> {
        match self
            .call(
                "reactions.remove",
                serde_json::json!({ "channel": channel, "timestamp": ts, "name": name }),
            )
            .await
        {
            Err(ChatError::Permanent(code)) if code == "no_reaction" => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn upload_file(
        &self,
        channel: &str,
        thread_ts: Option<&str>,
        path: &str,
        caption: &str,
    ) -> Result<(), ChatError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ChatError::Permanent(format!("cannot read {path}: {e}")))?;
        let filename = std::path::Path::new(path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload")
            .to_string();
        let mut form = reqwest::multipart::Form::new()
            .text("channels", channel.to_string())
            .text("initial_comment", caption.to_string())
            .part("file", reqwest::multipart::Part::bytes(bytes).file_name(filename));
        if let Some(ts) = thread_ts {
            form = form.text("thread_ts", ts.to_string());
        }

        let url = format!("{}/files.upload", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChatError::Transient(e.to_string()))?;
        if !response.status().is_success() {
            return Err(ChatError::Transient(format!(
                "file upload returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn open_modal(
        &self,
        trigger_id: &str,
        view: serde_json::Value,
    ) -> Result<(), ChatError> {
        self.call(
            "views.open",
            serde_json::json!({ "trigger_id": trigger_id, "view": view }),
        )
        .await
        .map(|_| ())
    }
}
