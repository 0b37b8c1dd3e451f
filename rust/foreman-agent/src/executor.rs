//! Execution-engine contract and the subprocess bridge.
//!
//! The engine that actually runs the code-generation tool is an external
//! collaborator: it accepts a task submission, emits a stream of progress
//! and output events, and reports a terminal outcome. [`ProcessEngine`]
//! bridges that contract over a line-delimited JSON subprocess.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use thiserror::Error;

use foreman_protocol::{ProgressKind, TaskSubmit};

/// What the engine is asked to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub task_id: String,
    pub command: String,
    pub prompt: String,
    pub system_prompt: String,
    pub local_path: String,
    pub model: String,
    pub max_budget: f64,
    pub allowed_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resume_session_id: Option<String>,
}

impl From<&TaskSubmit> for ExecutionRequest {
    fn from(submit: &TaskSubmit) -> Self {
        Self {
            task_id: submit.task_id.clone(),
            command: submit.command.clone(),
            prompt: submit.prompt.clone(),
            system_prompt: submit.system_prompt.clone(),
            local_path: submit.local_path.clone(),
            model: submit.model.clone(),
            max_budget: submit.max_budget,
            allowed_tools: submit.allowed_tools.clone(),
            resume_session_id: submit.resume_session_id.clone(),
        }
    }
}

/// Incremental events the engine emits while running.
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    Progress { kind: ProgressKind, message: String },
    Stream { delta: String },
}

/// Terminal success report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub result: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub estimated_cost: f64,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub commands_run: Vec<String>,
}

/// Terminal failure report.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The invocation hit its turn cap; the cloud decides whether to
    /// continue the session.
    #[error("max turns reached")]
    MaxTurns { session_id: Option<String> },

    #[error("execution failed: {message}")]
    Failed {
        message: String,
        recoverable: bool,
        session_id: Option<String>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The engine contract the processor drives.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    async fn run(
        &self,
        request: ExecutionRequest,
        events: mpsc::UnboundedSender<ExecutionEvent>,
    ) -> Result<ExecutionOutcome, EngineError>;
}

/// One line of the bridge's stdout protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BridgeLine {
    Progress {
        #[serde(default = "default_progress_kind")]
        kind: ProgressKind,
        message: String,
    },
    Stream {
        delta: String,
    },
    Complete {
        #[serde(flatten)]
        outcome: ExecutionOutcome,
    },
    Error {
        message: String,
        #[serde(default)]
        recoverable: bool,
        #[serde(default)]
        max_turns: bool,
        #[serde(default)]
        session_id: Option<String>,
    },
}

fn default_progress_kind() -> ProgressKind {
    ProgressKind::Info
}

/// Runs one subprocess per task: the request goes to stdin as a single JSON
/// line, events come back as JSON lines on stdout. Killing the child is the
/// abort path; the processor owns that through its task handle.
pub struct ProcessEngine {
    command: String,
}

impl ProcessEngine {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
    async fn run(
        &self,
        request: ExecutionRequest,
        events: mpsc::UnboundedSender<ExecutionEvent>,
    ) -> Result<ExecutionOutcome, EngineError> {
        let mut parts = self.command.split_whitespace();
        let program = parts.next().ok_or_else(|| EngineError::Failed {
            message: "empty engine command".to_string(),
            recoverable: false,
            session_id: None,
        })?;

        let mut child = tokio::process::Command::new(program)
            .args(parts)
            .current_dir(&request.local_path)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            let mut line = serde_json::to_string(&request).map_err(|e| EngineError::Failed {
                message: e.to_string(),
                recoverable: false,
                session_id: None,
            })?;
            line.push('\n');
            stdin.write_all(line.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let stdout = child.stdout.take().ok_or_else(|| EngineError::Failed {
            message: "engine has no stdout".to_string(),
            recoverable: false,
            session_id: None,
        })?;
        let mut lines = BufReader::new(stdout).lines();

        let mut outcome: Option<Result<ExecutionOutcome, EngineError>> = None;
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<BridgeLine>(&line) {
                Ok(BridgeLine::Progress { kind, message }) => {
                    let _ = events.send(ExecutionEvent::Progress { kind, message });
                }
                Ok(BridgeLine::Stream { delta }) => {
                    let _ = events.send(ExecutionEvent::Stream { delta });
                }
                Ok(BridgeLine::Complete { outcome: done }) => {
                    outcome = Some(Ok(done));
                    break;
                }
                Ok(BridgeLine::Error {
                    message,
                    recoverable,
                    max_turns,
                    session_id,
                }) => {
                    outcome = Some(Err(if max_turns {
                        EngineError::MaxTurns { session_id }
                    } else {
                        EngineError::Failed {
                            message,
                            recoverable,
                            session_id,
                        }
                    }));
                    break;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "unparseable engine line dropped");
                }
            }
        }

        let status = child.wait().await?;
        outcome.unwrap_or_else(|| {
            Err(EngineError::Failed {
                message: format!("engine exited ({status}) without a terminal report"),
                recoverable: true,
                session_id: None,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            task_id: "t1".into(),
            command: "fix".into(),
            prompt: "say hello".into(),
            system_prompt: String::new(),
            local_path: ".".into(),
            model: "standard-1".into(),
            max_budget: 1.0,
            allowed_tools: vec![],
            resume_session_id: None,
        }
    }

    #[tokio::test]
    async fn test_process_engine_round_trip() {
        // An engine that emits one progress line, one stream line, then
        // completes. `cat` is not it; use a tiny shell script.
        let script = r#"read _req
echo '{"type":"progress","kind":"info","message":"starting"}'
echo '{"type":"stream","delta":"hello"}'
echo '{"type":"complete","result":"done","input_tokens":10,"output_tokens":2}'"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sh");
        std::fs::write(&path, script).unwrap();

        let engine = ProcessEngine::new(format!("sh {}", path.display()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = engine.run(request(), tx).await.unwrap();

        assert_eq!(outcome.result, "done");
        assert_eq!(outcome.input_tokens, 10);
        assert!(matches!(
            rx.recv().await,
            Some(ExecutionEvent::Progress { .. })
        ));
        assert!(matches!(rx.recv().await, Some(ExecutionEvent::Stream { .. })));
    }

    #[tokio::test]
    async fn test_process_engine_max_turns() {
        let script = r#"read _req
echo '{"type":"error","message":"turn limit","max_turns":true,"session_id":"s-9"}'"#;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.sh");
        std::fs::write(&path, script).unwrap();

        let engine = ProcessEngine::new(format!("sh {}", path.display()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = engine.run(request(), tx).await.unwrap_err();
        match err {
            EngineError::MaxTurns { session_id } => {
                assert_eq!(session_id.as_deref(), Some("s-9"));
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[tokio::test]
    async fn test_process_engine_exit_without_report() {
        let engine = ProcessEngine::new("true");
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = engine.run(request(), tx).await.unwrap_err();
        assert!(matches!(err, EngineError::Failed { recoverable: true, .. }));
    }
}
