//! Agent registry: the live view of connected workers.
//!
//! One entry per agent id; registering a new connection evicts the prior
//! one. Observers subscribe for `Connected`/`Disconnected` events through a
//! sender list guarded by the same lock as the map, so each transition is
//! observed exactly once.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use foreman_protocol::{close, Frame};

/// Registry transition events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Connected { agent_id: String },
    Disconnected { agent_id: String },
}

/// Point-in-time view of one connected worker.
#[derive(Debug, Clone)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub active_tasks: Vec<String>,
}

struct AgentSlot {
    handle: ConnectionHandle,
    connected_at: DateTime<Utc>,
    last_heartbeat: DateTime<Utc>,
    active_tasks: Vec<String>,
}

#[derive(Default)]
struct Inner {
    agents: HashMap<String, AgentSlot>,
    observers: Vec<mpsc::UnboundedSender<RegistryEvent>>,
}

impl Inner {
    fn emit(&mut self, event: RegistryEvent) {
        self.observers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Mapping from agent id to its live connection.
#[derive(Default)]
pub struct AgentRegistry {
    inner: Mutex<Inner>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to connect/disconnect transitions.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegistryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().observers.push(tx);
        rx
    }

    /// Install a connection for `agent_id`, evicting any prior one with
    /// close reason "replaced". Fires `Connected` for the new socket.
    pub fn register(&self, agent_id: &str, handle: ConnectionHandle) {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        if let Some(prior) = inner.agents.remove(agent_id) {
            tracing::info!(agent_id, "replacing existing connection");
            prior.handle.close(close::NORMAL, close::REASON_REPLACED);
        }
        inner.agents.insert(
            agent_id.to_string(),
            AgentSlot {
                handle,
                connected_at: now,
                last_heartbeat: now,
                active_tasks: Vec::new(),
            },
        );
        inner.emit(RegistryEvent::Connected {
            agent_id: agent_id.to_string(),
        });
        tracing::info!(agent_id, "agent connected");
    }

    /// Remove `agent_id` only if the stored connection is identity-equal to
    /// `identity`. A stale close callback racing a replacement is a no-op.
    pub fn unregister(&self, agent_id: &str, identity: Uuid) -> bool {
        let mut inner = self.inner.lock();
        match inner.agents.get(agent_id) {
            Some(slot) if slot.handle.identity() == identity => {
                inner.agents.remove(agent_id);
                inner.emit(RegistryEvent::Disconnected {
                    agent_id: agent_id.to_string(),
                });
                tracing::info!(agent_id, "agent disconnected");
                true
            }
            Some(_) => {
                tracing::debug!(agent_id, "stale unregister ignored");
                false
            }
            None => false,
        }
    }

    /// Send a frame to `agent_id`. False if absent or the socket is gone.
    pub fn send(&self, agent_id: &str, frame: &Frame) -> bool {
        let inner = self.inner.lock();
        match inner.agents.get(agent_id) {
            Some(slot) if slot.handle.is_open() => slot.handle.send_frame(frame),
            _ => false,
        }
    }

    /// Pick a worker: the preferred one when online, otherwise the online
    /// worker with the fewest active tasks.
    pub fn resolve(&self, preferred: Option<&str>) -> Option<String> {
        let inner = self.inner.lock();
        if let Some(id) = preferred {
            if inner.agents.get(id).is_some_and(|s| s.handle.is_open()) {
                return Some(id.to_string());
            }
        }
        inner
            .agents
            .iter()
            .filter(|(_, slot)| slot.handle.is_open())
            .min_by_key(|(id, slot)| (slot.active_tasks.len(), id.to_string()))
            .map(|(id, _)| id.clone())
    }

    /// Record a heartbeat reply: advances liveness and the active-task list.
    pub fn beat(&self, agent_id: &str, active_tasks: Vec<String>) {
        if let Some(slot) = self.inner.lock().agents.get_mut(agent_id) {
            slot.last_heartbeat = Utc::now();
            slot.active_tasks = active_tasks;
        }
    }

    /// Close and remove workers whose last heartbeat is older than
    /// `threshold`. Fires `Disconnected` for each and returns their ids.
    pub fn sweep_dead(&self, threshold: Duration) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let mut inner = self.inner.lock();
        let dead: Vec<String> = inner
            .agents
            .iter()
            .filter(|(_, slot)| slot.last_heartbeat < cutoff)
            .map(|(id, _)| id.clone())
            .collect();
        for agent_id in &dead {
            if let Some(slot) = inner.agents.remove(agent_id) {
                slot.handle
                    .close(close::HEARTBEAT_TIMEOUT, "heartbeat timeout");
                inner.emit(RegistryEvent::Disconnected {
                    agent_id: agent_id.clone(),
                });
                tracing::warn!(agent_id, "agent swept: heartbeat timeout");
            }
        }
        dead
    }

    /// Send a frame to every online worker; returns how many accepted it.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        let inner = self.inner.lock();
        inner
            .agents
            .values()
            .filter(|slot| slot.handle.is_open() && slot.handle.send_frame(frame))
            .count()
    }

    pub fn is_online(&self, agent_id: &str) -> bool {
        self.inner
            .lock()
            .agents
            .get(agent_id)
            .is_some_and(|s| s.handle.is_open())
    }

    pub fn online_count(&self) -> usize {
        self.inner.lock().agents.len()
    }

    /// Snapshot of every connected worker (operator surface).
    pub fn snapshot(&self) -> Vec<AgentSnapshot> {
        self.inner
            .lock()
            .agents
            .iter()
            .map(|(id, slot)| AgentSnapshot {
                agent_id: id.clone(),
                connected_at: slot.connected_at,
                last_heartbeat: slot.last_heartbeat,
                active_tasks: slot.active_tasks.clone(),
            })
            .collect()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.online_count())
            .finish()
    }
}
