//! In-memory storage backend for tests and embedded runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{
    ApiKeyStore, AuditEntry, AuditLog, OfflineQueueStore, ProjectStore, QueuedMessage,
    ScheduleStore, StorageError, TaskStore,
};
use crate::domain::{ApiKey, Project, Schedule, Task};
use foreman_protocol::MessageKind;

/// One backend implements every store; each table behind its own lock.
#[derive(Default)]
pub struct MemoryBackend {
    tasks: Mutex<HashMap<String, Task>>,
    projects: Mutex<HashMap<String, Project>>,
    api_keys: Mutex<HashMap<String, ApiKey>>,
    offline: Mutex<Vec<QueuedMessage>>,
    next_serial: Mutex<i64>,
    schedules: Mutex<HashMap<String, Schedule>>,
    audit: Mutex<Vec<AuditEntry>>,
}

impl MemoryBackend {
    /// Audit entries recorded so far (test observability).
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.audit.lock().clone()
    }
}

#[async_trait]
impl TaskStore for MemoryBackend {
    async fn create(&self, task: &Task) -> Result<(), StorageError> {
        self.tasks.lock().insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StorageError> {
        Ok(self.tasks.lock().get(id).cloned())
    }

    async fn update(&self, task: &Task) -> Result<(), StorageError> {
        let mut tasks = self.tasks.lock();
        if !tasks.contains_key(&task.id) {
            return Err(StorageError::NotFound(task.id.clone()));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn find_by_parent(&self, parent_id: &str) -> Result<Vec<Task>, StorageError> {
        let mut children: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|t| t.parent_task_id.as_deref() == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(children)
    }

    async fn all_subtasks_terminal(&self, parent_id: &str) -> Result<bool, StorageError> {
        let tasks = self.tasks.lock();
        let mut any = false;
        for task in tasks.values() {
            if task.parent_task_id.as_deref() == Some(parent_id) {
                any = true;
                if !task.is_terminal() {
                    return Ok(false);
                }
            }
        }
        Ok(any)
    }

    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, t| !(t.is_terminal() && t.completed_at.map_or(false, |at| at < cutoff)));
        Ok((before - tasks.len()) as u64)
    }
}

#[async_trait]
impl ProjectStore for MemoryBackend {
    async fn get(&self, id: &str) -> Result<Option<Project>, StorageError> {
        Ok(self.projects.lock().get(id).cloned())
    }

    async fn find_by_channel(&self, channel_id: &str) -> Result<Option<Project>, StorageError> {
        Ok(self
            .projects
            .lock()
            .values()
            .find(|p| p.channel_id == channel_id)
            .cloned())
    }

    async fn upsert(&self, project: &Project) -> Result<(), StorageError> {
        self.projects
            .lock()
            .insert(project.id.clone(), project.clone());
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for MemoryBackend {
    async fn find_by_key(&self, key: &str) -> Result<Option<ApiKey>, StorageError> {
        Ok(self.api_keys.lock().get(key).cloned())
    }

    async fn touch_last_used(&self, key: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        if let Some(k) = self.api_keys.lock().get_mut(key) {
            k.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn upsert(&self, api_key: &ApiKey) -> Result<(), StorageError> {
        self.api_keys
            .lock()
            .insert(api_key.key.clone(), api_key.clone());
        Ok(())
    }

    async fn revoke(&self, key: &str) -> Result<(), StorageError> {
        match self.api_keys.lock().get_mut(key) {
            Some(k) => {
                k.revoked = true;
                Ok(())
            }
            None => Err(StorageError::NotFound(key.to_string())),
        }
    }
}

#[async_trait]
impl OfflineQueueStore for MemoryBackend {
    async fn enqueue(
        &self,
        agent_id: &str,
        kind: MessageKind,
        payload: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let serial = {
            let mut next = self.next_serial.lock();
            *next += 1;
            *next
        };
        self.offline.lock().push(QueuedMessage {
            serial,
            agent_id: agent_id.to_string(),
            kind,
            payload,
            queued_at: Utc::now(),
            expires_at,
            attempts: 0,
            delivered: false,
        });
        Ok(serial)
    }

    async fn load_pending(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>, StorageError> {
        let mut pending: Vec<QueuedMessage> = self
            .offline
            .lock()
            .iter()
            .filter(|m| !m.delivered && m.expires_at > now)
            .cloned()
            .collect();
        pending.sort_by_key(|m| m.serial);
        Ok(pending)
    }

    async fn record_attempt(&self, serial: i64) -> Result<(), StorageError> {
        if let Some(m) = self.offline.lock().iter_mut().find(|m| m.serial == serial) {
            m.attempts += 1;
        }
        Ok(())
    }

    async fn mark_delivered(&self, serial: i64) -> Result<(), StorageError> {
        match self.offline.lock().iter_mut().find(|m| m.serial == serial) {
            Some(m) => {
                m.delivered = true;
                Ok(())
            }
            None => Err(StorageError::NotFound(serial.to_string())),
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut offline = self.offline.lock();
        let before = offline.len();
        offline.retain(|m| m.expires_at > now && !m.delivered);
        Ok((before - offline.len()) as u64)
    }
}

#[async_trait]
impl ScheduleStore for MemoryBackend {
    async fn create(&self, schedule: &Schedule) -> Result<(), StorageError> {
        self.schedules
            .lock()
            .insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Schedule>, StorageError> {
        Ok(self.schedules.lock().get(id).cloned())
    }

    async fn update(&self, schedule: &Schedule) -> Result<(), StorageError> {
        let mut schedules = self.schedules.lock();
        if !schedules.contains_key(&schedule.id) {
            return Err(StorageError::NotFound(schedule.id.clone()));
        }
        schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StorageError> {
        Ok(self
            .schedules
            .lock()
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditLog for MemoryBackend {
    async fn append(&self, entry: AuditEntry) -> Result<(), StorageError> {
        self.audit.lock().push(entry);
        Ok(())
    }
}
