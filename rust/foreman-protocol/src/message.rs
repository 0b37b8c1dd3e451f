//! Typed message payloads, one per wire kind.
//!
//! Wire field names are camelCase to match what workers send; the Rust side
//! stays snake_case via serde renames. Each payload carries its own semantic
//! validation beyond what serde enforces structurally.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// The closed enumeration of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    AuthRequest,
    AuthResponse,
    HeartbeatPing,
    HeartbeatPong,
    TaskSubmit,
    TaskAck,
    TaskProgress,
    TaskStream,
    TaskComplete,
    TaskError,
    TaskCancel,
    TaskCancelled,
    AgentStatus,
    SystemRestart,
}

impl MessageKind {
    /// The wire tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthRequest => "auth_request",
            Self::AuthResponse => "auth_response",
            Self::HeartbeatPing => "heartbeat_ping",
            Self::HeartbeatPong => "heartbeat_pong",
            Self::TaskSubmit => "task_submit",
            Self::TaskAck => "task_ack",
            Self::TaskProgress => "task_progress",
            Self::TaskStream => "task_stream",
            Self::TaskComplete => "task_complete",
            Self::TaskError => "task_error",
            Self::TaskCancel => "task_cancel",
            Self::TaskCancelled => "task_cancelled",
            Self::AgentStatus => "agent_status",
            Self::SystemRestart => "system_restart",
        }
    }
}

impl std::str::FromStr for MessageKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth_request" => Ok(Self::AuthRequest),
            "auth_response" => Ok(Self::AuthResponse),
            "heartbeat_ping" => Ok(Self::HeartbeatPing),
            "heartbeat_pong" => Ok(Self::HeartbeatPong),
            "task_submit" => Ok(Self::TaskSubmit),
            "task_ack" => Ok(Self::TaskAck),
            "task_progress" => Ok(Self::TaskProgress),
            "task_stream" => Ok(Self::TaskStream),
            "task_complete" => Ok(Self::TaskComplete),
            "task_error" => Ok(Self::TaskError),
            "task_cancel" => Ok(Self::TaskCancel),
            "task_cancelled" => Ok(Self::TaskCancelled),
            "agent_status" => Ok(Self::AgentStatus),
            "system_restart" => Ok(Self::SystemRestart),
            other => Err(ProtocolError::UnknownKind {
                kind: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker credential presentation; the only message accepted pre-auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub agent_id: String,
    pub api_key: String,
    pub version: String,
}

/// Gateway reply to an [`AuthRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Liveness probe sent by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPing {
    /// Gateway wall clock in epoch milliseconds.
    pub server_time: i64,
}

/// Worker liveness reply carrying its current load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPong {
    pub agent_id: String,
    /// Echo of the ping's server time.
    pub server_time: i64,
    pub active_tasks: Vec<String>,
    /// CPU busy percentage, 0-100.
    pub cpu_usage: f64,
    /// Resident memory percentage, 0-100.
    pub memory_usage: f64,
}

/// Chat correlation for a task: the channel, thread, and user it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatContext {
    pub channel_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    pub user_id: String,
}

/// Descriptor for a file the user attached to the originating message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A task handed to a worker for execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSubmit {
    pub task_id: String,
    pub project_id: String,
    pub bot_name: String,
    pub command: String,
    pub prompt: String,
    pub system_prompt: String,
    /// Filesystem path of the project on the worker host.
    pub local_path: String,
    pub model: String,
    pub max_budget: f64,
    pub allowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_continuations: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    pub slack_context: ChatContext,
}

/// Worker acknowledgement that a submit was accepted or rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAck {
    pub task_id: String,
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u32>,
}

/// Category of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    ToolUse,
    Thinking,
    Info,
}

/// A discrete execution step (tool use, thinking, informational note).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: ProgressKind,
    pub message: String,
    pub timestamp: i64,
}

/// An incremental chunk of the worker's output text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStream {
    pub task_id: String,
    pub delta: String,
    pub timestamp: i64,
}

/// Terminal success report with aggregate usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskComplete {
    pub task_id: String,
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: f64,
    pub files_changed: Vec<String>,
    pub commands_run: Vec<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub continuations: Option<u32>,
    pub model: String,
}

/// Terminal failure report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskError {
    pub task_id: String,
    pub error: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Cancellation request, broadcast by the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancel {
    pub task_id: String,
    pub reason: String,
}

/// Worker confirmation that a task was aborted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancelled {
    pub task_id: String,
    pub reason: String,
}

/// Unsolicited worker status report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub agent_id: String,
    pub status: String,
    pub active_tasks: Vec<String>,
}

/// Gateway notice that the worker should restart gracefully.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemRestart {
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_at: Option<i64>,
}

/// The typed payload union over every message kind.
#[derive(Debug, Clone)]
pub enum Message {
    AuthRequest(AuthRequest),
    AuthResponse(AuthResponse),
    HeartbeatPing(HeartbeatPing),
    HeartbeatPong(HeartbeatPong),
    TaskSubmit(TaskSubmit),
    TaskAck(TaskAck),
    TaskProgress(TaskProgress),
    TaskStream(TaskStream),
    TaskComplete(TaskComplete),
    TaskError(TaskError),
    TaskCancel(TaskCancel),
    TaskCancelled(TaskCancelled),
    AgentStatus(AgentStatus),
    SystemRestart(SystemRestart),
}

impl Message {
    /// The kind tag for this payload.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::AuthRequest(_) => MessageKind::AuthRequest,
            Self::AuthResponse(_) => MessageKind::AuthResponse,
            Self::HeartbeatPing(_) => MessageKind::HeartbeatPing,
            Self::HeartbeatPong(_) => MessageKind::HeartbeatPong,
            Self::TaskSubmit(_) => MessageKind::TaskSubmit,
            Self::TaskAck(_) => MessageKind::TaskAck,
            Self::TaskProgress(_) => MessageKind::TaskProgress,
            Self::TaskStream(_) => MessageKind::TaskStream,
            Self::TaskComplete(_) => MessageKind::TaskComplete,
            Self::TaskError(_) => MessageKind::TaskError,
            Self::TaskCancel(_) => MessageKind::TaskCancel,
            Self::TaskCancelled(_) => MessageKind::TaskCancelled,
            Self::AgentStatus(_) => MessageKind::AgentStatus,
            Self::SystemRestart(_) => MessageKind::SystemRestart,
        }
    }

    /// The task id this message refers to, if it is task-scoped.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::TaskSubmit(p) => Some(&p.task_id),
            Self::TaskAck(p) => Some(&p.task_id),
            Self::TaskProgress(p) => Some(&p.task_id),
            Self::TaskStream(p) => Some(&p.task_id),
            Self::TaskComplete(p) => Some(&p.task_id),
            Self::TaskError(p) => Some(&p.task_id),
            Self::TaskCancel(p) => Some(&p.task_id),
            Self::TaskCancelled(p) => Some(&p.task_id),
            _ => None,
        }
    }

    /// Serialize the payload to a JSON value.
    pub fn to_payload(&self) -> Result<serde_json::Value, ProtocolError> {
        let encode = |r: serde_json::Result<serde_json::Value>| {
            r.map_err(|e| ProtocolError::Encode {
                kind: self.kind().as_str().to_string(),
                reason: e.to_string(),
            })
        };
        match self {
            Self::AuthRequest(p) => encode(serde_json::to_value(p)),
            Self::AuthResponse(p) => encode(serde_json::to_value(p)),
            Self::HeartbeatPing(p) => encode(serde_json::to_value(p)),
            Self::HeartbeatPong(p) => encode(serde_json::to_value(p)),
            Self::TaskSubmit(p) => encode(serde_json::to_value(p)),
            Self::TaskAck(p) => encode(serde_json::to_value(p)),
            Self::TaskProgress(p) => encode(serde_json::to_value(p)),
            Self::TaskStream(p) => encode(serde_json::to_value(p)),
            Self::TaskComplete(p) => encode(serde_json::to_value(p)),
            Self::TaskError(p) => encode(serde_json::to_value(p)),
            Self::TaskCancel(p) => encode(serde_json::to_value(p)),
            Self::TaskCancelled(p) => encode(serde_json::to_value(p)),
            Self::AgentStatus(p) => encode(serde_json::to_value(p)),
            Self::SystemRestart(p) => encode(serde_json::to_value(p)),
        }
    }

    /// Deserialize and validate a payload for the given kind.
    pub fn from_payload(
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> Result<Self, ProtocolError> {
        fn decode<T: serde::de::DeserializeOwned>(
            kind: MessageKind,
            payload: serde_json::Value,
        ) -> Result<T, ProtocolError> {
            serde_json::from_value(payload)
                .map_err(|e| ProtocolError::malformed(kind.as_str(), e.to_string()))
        }

        let message = match kind {
            MessageKind::AuthRequest => Self::AuthRequest(decode(kind, payload)?),
            MessageKind::AuthResponse => Self::AuthResponse(decode(kind, payload)?),
            MessageKind::HeartbeatPing => Self::HeartbeatPing(decode(kind, payload)?),
            MessageKind::HeartbeatPong => Self::HeartbeatPong(decode(kind, payload)?),
            MessageKind::TaskSubmit => Self::TaskSubmit(decode(kind, payload)?),
            MessageKind::TaskAck => Self::TaskAck(decode(kind, payload)?),
            MessageKind::TaskProgress => Self::TaskProgress(decode(kind, payload)?),
            MessageKind::TaskStream => Self::TaskStream(decode(kind, payload)?),
            MessageKind::TaskComplete => Self::TaskComplete(decode(kind, payload)?),
            MessageKind::TaskError => Self::TaskError(decode(kind, payload)?),
            MessageKind::TaskCancel => Self::TaskCancel(decode(kind, payload)?),
            MessageKind::TaskCancelled => Self::TaskCancelled(decode(kind, payload)?),
            MessageKind::AgentStatus => Self::AgentStatus(decode(kind, payload)?),
            MessageKind::SystemRestart => Self::SystemRestart(decode(kind, payload)?),
        };
        message.validate()?;
        Ok(message)
    }

    /// Semantic validation beyond structural decoding.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        let kind = self.kind();
        let fail = |reason: &str| Err(ProtocolError::malformed(kind.as_str(), reason));

        if let Some(task_id) = self.task_id() {
            if task_id.is_empty() {
                return fail("taskId must not be empty");
            }
        }
        match self {
            Self::AuthRequest(p) => {
                if p.agent_id.is_empty() {
                    return fail("agentId must not be empty");
                }
                if p.api_key.is_empty() {
                    return fail("apiKey must not be empty");
                }
            }
            Self::HeartbeatPong(p) => {
                if p.agent_id.is_empty() {
                    return fail("agentId must not be empty");
                }
                if !(0.0..=100.0).contains(&p.cpu_usage) {
                    return fail("cpuUsage must be within 0-100");
                }
                if !(0.0..=100.0).contains(&p.memory_usage) {
                    return fail("memoryUsage must be within 0-100");
                }
            }
            Self::TaskSubmit(p) => {
                if p.project_id.is_empty() {
                    return fail("projectId must not be empty");
                }
                if p.prompt.is_empty() {
                    return fail("prompt must not be empty");
                }
                if p.slack_context.channel_id.is_empty() {
                    return fail("slackContext.channelId must not be empty");
                }
            }
            Self::AgentStatus(p) => {
                if p.agent_id.is_empty() {
                    return fail("agentId must not be empty");
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in [
            MessageKind::AuthRequest,
            MessageKind::TaskSubmit,
            MessageKind::TaskCancelled,
            MessageKind::SystemRestart,
        ] {
            let parsed: MessageKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = "task_explode".parse::<MessageKind>().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownKind { .. }));
    }

    #[test]
    fn test_payload_field_names_are_camel_case() {
        let pong = HeartbeatPong {
            agent_id: "w1".into(),
            server_time: 1_700_000_000_000,
            active_tasks: vec!["t1".into()],
            cpu_usage: 12.5,
            memory_usage: 40.0,
        };
        let value = serde_json::to_value(&pong).unwrap();
        assert!(value.get("agentId").is_some());
        assert!(value.get("activeTasks").is_some());
        assert!(value.get("cpuUsage").is_some());
    }

    #[test]
    fn test_progress_kind_wire_names() {
        let progress = TaskProgress {
            task_id: "t1".into(),
            kind: ProgressKind::ToolUse,
            message: "Reading auth.ts".into(),
            timestamp: 0,
        };
        let value = serde_json::to_value(&progress).unwrap();
        assert_eq!(value["type"], "tool_use");
    }

    #[test]
    fn test_validation_rejects_empty_task_id() {
        let payload = serde_json::json!({
            "taskId": "",
            "delta": "x",
            "timestamp": 0,
        });
        let err = Message::from_payload(MessageKind::TaskStream, payload).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }));
    }

    #[test]
    fn test_validation_rejects_out_of_range_cpu() {
        let payload = serde_json::json!({
            "agentId": "w1",
            "serverTime": 0,
            "activeTasks": [],
            "cpuUsage": 250.0,
            "memoryUsage": 10.0,
        });
        let err = Message::from_payload(MessageKind::HeartbeatPong, payload).unwrap_err();
        match err {
            ProtocolError::Malformed { kind, reason } => {
                assert_eq!(kind, "heartbeat_pong");
                assert!(reason.contains("cpuUsage"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
