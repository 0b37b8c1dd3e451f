//! Message router: dispatch inbound worker events to their handlers by
//! kind.
//!
//! Handlers are awaited sequentially per connection (the gateway calls
//! `dispatch` inline from each read loop), which preserves per-worker event
//! order; different connections route in parallel. Anything a handler does
//! wrong is caught and logged here so the socket never pays for it.

use std::sync::Arc;

use crate::handlers::LifecycleHandlers;
use crate::registry::AgentRegistry;
use foreman_protocol::{Inbound, Message};

/// Kind-keyed dispatcher for post-auth worker messages.
pub struct MessageRouter {
    handlers: Arc<LifecycleHandlers>,
    registry: Arc<AgentRegistry>,
}

impl MessageRouter {
    pub fn new(handlers: Arc<LifecycleHandlers>, registry: Arc<AgentRegistry>) -> Self {
        Self { handlers, registry }
    }

    /// Route one parsed message from `agent_id`.
    pub async fn dispatch(&self, agent_id: &str, inbound: Inbound) {
        let kind = inbound.message.kind();
        tracing::debug!(agent_id, %kind, message_id = %inbound.id, "routing message");

        match inbound.message {
            Message::TaskAck(payload) => self.handlers.on_ack(agent_id, payload).await,
            Message::TaskProgress(payload) => self.handlers.on_progress(agent_id, payload).await,
            Message::TaskStream(payload) => self.handlers.on_stream(agent_id, payload).await,
            Message::TaskComplete(payload) => self.handlers.on_complete(agent_id, payload).await,
            Message::TaskError(payload) => self.handlers.on_error(agent_id, payload).await,
            Message::TaskCancelled(payload) => self.handlers.on_cancelled(agent_id, payload).await,
            Message::AgentStatus(payload) => {
                self.registry.beat(agent_id, payload.active_tasks);
            }
            Message::HeartbeatPong(payload) => {
                // Normally consumed by the gateway loop; a pong landing here
                // still advances liveness.
                self.registry.beat(agent_id, payload.active_tasks);
            }
            other => {
                tracing::warn!(agent_id, kind = %other.kind(), "unexpected message kind dropped");
            }
        }
    }
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter").finish_non_exhaustive()
    }
}
