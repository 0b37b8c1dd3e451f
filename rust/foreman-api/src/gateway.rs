//! Connection gateway: accepts worker sockets, authenticates them, enforces
//! heartbeats, and feeds inbound messages to the router.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::AppConfig;
use crate::connection::{ConnectionHandle, Outbound};
use crate::registry::AgentRegistry;
use crate::router::MessageRouter;
use crate::storage::{AuditEntry, Storage};
use foreman_protocol::{
    close, AuthResponse, Frame, HeartbeatPing, Inbound, Message, ProtocolError,
};

/// Shared state for the agent socket endpoint.
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<AgentRegistry>,
    pub storage: Storage,
    pub router: Arc<MessageRouter>,
    pub config: Arc<AppConfig>,
}

/// Routes exposed by the gateway.
pub fn router() -> Router<GatewayState> {
    Router::new().route("/api/v1/agents/ws", get(agent_ws))
}

/// Upgrade an inbound worker connection.
async fn agent_ws(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if state.config.server.require_secure_transport {
        let forwarded_secure = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|proto| proto.eq_ignore_ascii_case("https"));
        if !forwarded_secure {
            return (StatusCode::FORBIDDEN, "secure transport required").into_response();
        }
    }
    ws.on_upgrade(move |socket| {
        let span = tracing::info_span!("agent_session", agent_id = tracing::field::Empty);
        handle_socket(state, socket).instrument(span)
    })
}

async fn handle_socket(state: GatewayState, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (handle, mut out_rx) = ConnectionHandle::new();

    // Writer task: the single owner of the sink. Everything else sends
    // through the connection handle.
    let writer: JoinHandle<()> = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            match outbound {
                Outbound::Text(text) => {
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Authentication phase: bounded window, AuthRequest only.
    let auth_timeout = state.config.dispatch.auth_timeout();
    let agent_id = match authenticate(&state, &handle, &mut ws_rx, auth_timeout).await {
        Some(agent_id) => agent_id,
        None => {
            // Dropping the handle ends the writer once any queued close has
            // been flushed.
            drop(handle);
            let _ = writer.await;
            return;
        }
    };
    tracing::Span::current().record("agent_id", agent_id.as_str());

    // Main read loop. Handler invocations are awaited sequentially here,
    // which preserves per-worker message order.
    while let Some(incoming) = ws_rx.next().await {
        let message = match incoming {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(error = %err, "socket read error");
                break;
            }
        };
        match message {
            WsMessage::Text(text) => match Frame::decode(&text) {
                Ok(inbound) => {
                    route_inbound(&state, &agent_id, inbound).await;
                }
                Err(ProtocolError::UnknownKind { kind }) => {
                    tracing::warn!(agent_id, kind, "unknown message kind dropped");
                }
                Err(err) => {
                    tracing::warn!(agent_id, error = %err, "malformed message dropped");
                }
            },
            WsMessage::Close(_) => break,
            // Protocol-level ping/pong is answered by the transport; the
            // fabric's liveness runs on heartbeat frames.
            _ => {}
        }
    }

    // Close handler: only unregister if the registered connection is still
    // this one; a replacement's close callback must not evict the newcomer.
    state.registry.unregister(&agent_id, handle.identity());
    writer.abort();
}

async fn route_inbound(state: &GatewayState, agent_id: &str, inbound: Inbound) {
    if let Message::HeartbeatPong(pong) = &inbound.message {
        if pong.agent_id != agent_id {
            tracing::warn!(
                agent_id,
                claimed = %pong.agent_id,
                "pong for a different agent dropped"
            );
            return;
        }
        state.registry.beat(agent_id, pong.active_tasks.clone());
        return;
    }
    state.router.dispatch(agent_id, inbound).await;
}

/// Run the pre-auth window: only an `AuthRequest` with a valid credential
/// gets through; everything else closes the socket with a distinct code.
async fn authenticate(
    state: &GatewayState,
    handle: &ConnectionHandle,
    ws_rx: &mut (impl StreamExt<Item = Result<WsMessage, axum::Error>> + Unpin),
    window: Duration,
) -> Option<String> {
    let first = tokio::time::timeout(window, ws_rx.next()).await;
    let message = match first {
        Err(_) => {
            tracing::info!("auth window elapsed, closing");
            handle.close(close::AUTH_TIMEOUT, "auth timeout");
            return None;
        }
        Ok(None) => return None,
        Ok(Some(Err(_))) => return None,
        Ok(Some(Ok(message))) => message,
    };

    let text = match message {
        WsMessage::Text(text) => text,
        WsMessage::Close(_) => return None,
        _ => {
            handle.close(close::PRE_AUTH_MESSAGE, close::REASON_MUST_AUTH);
            return None;
        }
    };

    let request = match Frame::decode(&text) {
        Ok(Inbound {
            message: Message::AuthRequest(request),
            ..
        }) => request,
        Ok(inbound) => {
            tracing::warn!(kind = %inbound.message.kind(), "pre-auth message rejected");
            handle.close(close::PRE_AUTH_MESSAGE, close::REASON_MUST_AUTH);
            return None;
        }
        Err(ProtocolError::UnknownKind { kind }) => {
            tracing::warn!(kind, "unknown kind before auth");
            handle.close(close::PRE_AUTH_MESSAGE, close::REASON_MUST_AUTH);
            return None;
        }
        Err(err) => {
            tracing::warn!(error = %err, "malformed auth payload");
            handle.close(close::MALFORMED_AUTH, "malformed auth payload");
            return None;
        }
    };

    let now = chrono::Utc::now();
    let verdict = match state.storage.api_keys.find_by_key(&request.api_key).await {
        Ok(Some(key)) if !key.is_valid_at(now) => Err(if key.revoked {
            "revoked"
        } else {
            "expired"
        }),
        Ok(Some(key)) if key.agent_id != request.agent_id => Err("agent id mismatch"),
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err("unknown key"),
        Err(err) => {
            tracing::error!(error = %err, "credential lookup failed");
            Err("credential lookup failed")
        }
    };

    if let Err(reason) = verdict {
        tracing::warn!(agent_id = %request.agent_id, reason, "authentication rejected");
        send_auth_response(
            handle,
            AuthResponse {
                success: false,
                error: Some(reason.to_string()),
                agent_id: None,
            },
        );
        handle.close(close::INVALID_CREDENTIAL, reason);
        let _ = state
            .storage
            .audit
            .append(
                AuditEntry::new("agent.auth_rejected", serde_json::json!({ "reason": reason }))
                    .for_agent(&request.agent_id),
            )
            .await;
        return None;
    }

    let _ = state
        .storage
        .api_keys
        .touch_last_used(&request.api_key, now)
        .await;
    state.registry.register(&request.agent_id, handle.clone());
    send_auth_response(
        handle,
        AuthResponse {
            success: true,
            error: None,
            agent_id: Some(request.agent_id.clone()),
        },
    );
    tracing::info!(agent_id = %request.agent_id, version = %request.version, "agent authenticated");
    let _ = state
        .storage
        .audit
        .append(
            AuditEntry::new(
                "agent.connected",
                serde_json::json!({ "version": request.version }),
            )
            .for_agent(&request.agent_id),
        )
        .await;
    Some(request.agent_id)
}

fn send_auth_response(handle: &ConnectionHandle, response: AuthResponse) {
    if let Ok(frame) = Frame::new(&Message::AuthResponse(response)) {
        handle.send_frame(&frame);
    }
}

/// Spawn the liveness sweep: every heartbeat interval, close workers past
/// the dead threshold (twice the interval) and ping the live ones.
pub fn spawn_sweeper(registry: Arc<AgentRegistry>, config: Arc<AppConfig>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.dispatch.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let dead = registry.sweep_dead(config.dispatch.dead_threshold());
            if !dead.is_empty() {
                tracing::warn!(count = dead.len(), agents = ?dead, "swept dead agents");
            }
            let ping = Message::HeartbeatPing(HeartbeatPing {
                server_time: chrono::Utc::now().timestamp_millis(),
            });
            if let Ok(frame) = Frame::new(&ping) {
                registry.broadcast(&frame);
            }
        }
    })
}
