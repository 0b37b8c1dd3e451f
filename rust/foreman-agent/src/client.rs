//! Gateway client connection: authenticate, heartbeat, receive work, and
//! reconnect with backoff when the link drops.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use crate::monitor::ResourceMonitor;
use crate::processor::{SubmitDisposition, TaskProcessor};
use foreman_protocol::{AuthRequest, Frame, HeartbeatPong, Message, ProtocolError, TaskAck};

/// Why a session ended.
enum SessionEnd {
    /// Connection dropped or the gateway asked for a restart; reconnect.
    Reconnect,
    /// Local shutdown; do not reconnect.
    Shutdown,
}

/// Long-lived client: owns the reconnect loop around one session at a time.
pub struct AgentClient {
    config: Arc<AgentConfig>,
    processor: Arc<TaskProcessor>,
    monitor: Arc<ResourceMonitor>,
    outbound: mpsc::UnboundedReceiver<Message>,
    shutdown: watch::Receiver<bool>,
}

impl AgentClient {
    pub fn new(
        config: Arc<AgentConfig>,
        processor: Arc<TaskProcessor>,
        monitor: Arc<ResourceMonitor>,
        outbound: mpsc::UnboundedReceiver<Message>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            processor,
            monitor,
            outbound,
            shutdown,
        }
    }

    /// Run until shut down, reconnecting with exponential backoff.
    pub async fn run(mut self) -> AgentResult<()> {
        let mut backoff = self.config.reconnect_base();
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let session = Session {
                config: self.config.clone(),
                processor: self.processor.clone(),
                monitor: self.monitor.clone(),
            };
            match session
                .connect_and_run(&mut self.outbound, &mut self.shutdown)
                .await
            {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Reconnect) => {
                    backoff = self.config.reconnect_base();
                }
                Err(err) => {
                    tracing::warn!(error = %err, "session failed");
                }
            }
            if *self.shutdown.borrow() {
                break;
            }
            let jitter = Duration::from_millis(rand::rng().random_range(0..250));
            tracing::info!(delay_ms = backoff.as_millis() as u64, "reconnecting");
            tokio::time::sleep(backoff + jitter).await;
            backoff = (backoff * 2).min(self.config.reconnect_max());
        }
        self.processor.abort_all("agent shutting down");
        Ok(())
    }
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("agent_id", &self.config.agent_id)
            .finish_non_exhaustive()
    }
}

/// One connection's context.
struct Session {
    config: Arc<AgentConfig>,
    processor: Arc<TaskProcessor>,
    monitor: Arc<ResourceMonitor>,
}

impl Session {
    /// Connect, authenticate, then pump messages both ways until the socket
    /// dies or shutdown fires.
    async fn connect_and_run(
        &self,
        outbound: &mut mpsc::UnboundedReceiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AgentResult<SessionEnd> {
        tracing::info!(url = %self.config.gateway_url, "connecting to gateway");
        let (socket, _) = connect_async(self.config.gateway_url.as_str())
            .await
            .map_err(|e| AgentError::Connection(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        // Authenticate inside the gateway's pre-auth window.
        let auth = Message::AuthRequest(AuthRequest {
            agent_id: self.config.agent_id.clone(),
            api_key: self.config.api_key.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        send_message(&mut sink, &auth).await?;

        let authed = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(incoming) = stream.next().await {
                let Ok(WsMessage::Text(text)) = incoming else {
                    continue;
                };
                if let Ok(inbound) = Frame::decode(text.as_str()) {
                    if let Message::AuthResponse(response) = inbound.message {
                        return Some(response);
                    }
                }
            }
            None
        })
        .await
        .map_err(|_| AgentError::Connection("auth response timed out".into()))?;

        match authed {
            Some(response) if response.success => {
                tracing::info!(agent_id = %self.config.agent_id, "authenticated");
            }
            Some(response) => {
                return Err(AgentError::AuthRejected(
                    response.error.unwrap_or_else(|| "unspecified".into()),
                ));
            }
            None => return Err(AgentError::Connection("socket closed during auth".into())),
        }

        loop {
            tokio::select! {
                // Worker-originated traffic (progress, stream, terminals).
                queued = outbound.recv() => {
                    let Some(message) = queued else {
                        return Ok(SessionEnd::Shutdown);
                    };
                    send_message(&mut sink, &message).await?;
                }

                incoming = stream.next() => {
                    let message = match incoming {
                        Some(Ok(message)) => message,
                        Some(Err(err)) => {
                            tracing::warn!(error = %err, "socket read error");
                            return Ok(SessionEnd::Reconnect);
                        }
                        None => return Ok(SessionEnd::Reconnect),
                    };
                    match message {
                        WsMessage::Text(text) => match Frame::decode(text.as_str()) {
                            Ok(inbound) => {
                                if let Some(end) =
                                    self.handle_inbound(&mut sink, inbound.message).await?
                                {
                                    return Ok(end);
                                }
                            }
                            Err(ProtocolError::UnknownKind { kind }) => {
                                tracing::warn!(kind, "unknown gateway message dropped");
                            }
                            Err(err) => {
                                tracing::warn!(error = %err, "malformed gateway message");
                            }
                        },
                        WsMessage::Close(frame) => {
                            tracing::info!(?frame, "gateway closed connection");
                            return Ok(SessionEnd::Reconnect);
                        }
                        _ => {}
                    }
                }

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.processor.abort_all("agent shutting down");
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
            }
        }
    }

    async fn handle_inbound<S>(
        &self,
        sink: &mut S,
        message: Message,
    ) -> AgentResult<Option<SessionEnd>>
    where
        S: Sink<WsMessage> + Unpin,
        S::Error: std::fmt::Display,
    {
        match message {
            Message::HeartbeatPing(ping) => {
                let sample = self.monitor.last();
                let pong = Message::HeartbeatPong(HeartbeatPong {
                    agent_id: self.config.agent_id.clone(),
                    server_time: ping.server_time,
                    active_tasks: self.processor.active_ids(),
                    cpu_usage: sample.cpu_pct.clamp(0.0, 100.0),
                    memory_usage: sample.memory_pct.clamp(0.0, 100.0),
                });
                send_message(sink, &pong).await?;
            }
            Message::TaskSubmit(submit) => {
                let task_id = submit.task_id.clone();
                let ack = match self.processor.submit(submit) {
                    Ok(SubmitDisposition::Started) | Ok(SubmitDisposition::Duplicate) => TaskAck {
                        task_id,
                        accepted: true,
                        reason: None,
                        queue_position: None,
                    },
                    Ok(SubmitDisposition::Queued { position }) => TaskAck {
                        task_id,
                        accepted: true,
                        reason: None,
                        queue_position: Some(position),
                    },
                    Err(err) => TaskAck {
                        task_id,
                        accepted: false,
                        reason: Some(err.to_string()),
                        queue_position: None,
                    },
                };
                send_message(sink, &Message::TaskAck(ack)).await?;
            }
            Message::TaskCancel(cancel) => {
                if !self.processor.cancel(&cancel.task_id, &cancel.reason) {
                    tracing::debug!(task_id = %cancel.task_id, "cancel for unknown task");
                }
            }
            Message::SystemRestart(restart) => {
                tracing::warn!(reason = %restart.reason, "gateway requested restart");
                self.processor.abort_all("system restart");
                return Ok(Some(SessionEnd::Reconnect));
            }
            other => {
                tracing::debug!(kind = %other.kind(), "unhandled gateway message");
            }
        }
        Ok(None)
    }
}

async fn send_message<S>(sink: &mut S, message: &Message) -> AgentResult<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let frame = Frame::new(message)?;
    let text = frame.encode()?;
    sink.send(WsMessage::Text(text.into()))
        .await
        .map_err(|e| AgentError::Connection(e.to_string()))
}
