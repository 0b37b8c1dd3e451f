//! Storage collaborator contract.
//!
//! Trait-based repositories so the dispatch fabric never names a concrete
//! backend: an in-memory implementation backs tests and embedded runs, a
//! PostgreSQL implementation backs production.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::domain::{ApiKey, Project, Schedule, Task};
use foreman_protocol::MessageKind;

/// Storage failures. `NotFound` is reserved for updates against missing
/// rows; point lookups return `Option`.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("row not found: {0}")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("stored row failed to deserialize: {0}")]
    Corrupt(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}

/// A message owed to a worker that was offline at send time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Monotone serial id assigned by the store.
    pub serial: i64,
    pub agent_id: String,
    pub kind: MessageKind,
    /// Serialized payload, replayed verbatim on delivery.
    pub payload: serde_json::Value,
    pub queued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub attempts: u32,
    pub delivered: bool,
}

/// Append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Machine-readable action code, e.g. `task.completed`.
    pub action: String,
    pub detail: serde_json::Value,
    pub at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(action: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: None,
            agent_id: None,
            action: action.into(),
            detail,
            at: Utc::now(),
        }
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn for_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }
}

/// Task CRUD plus the aggregate queries the lifecycle handlers need.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn create(&self, task: &Task) -> Result<(), StorageError>;
    async fn get(&self, id: &str) -> Result<Option<Task>, StorageError>;
    async fn update(&self, task: &Task) -> Result<(), StorageError>;
    async fn find_by_parent(&self, parent_id: &str) -> Result<Vec<Task>, StorageError>;
    /// Whether every subtask of `parent_id` is in a terminal state. False
    /// when there are no subtasks.
    async fn all_subtasks_terminal(&self, parent_id: &str) -> Result<bool, StorageError>;
    /// Retention: delete terminal tasks whose terminal transition is older
    /// than `cutoff`. Returns the number deleted.
    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError>;
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Project>, StorageError>;
    async fn find_by_channel(&self, channel_id: &str) -> Result<Option<Project>, StorageError>;
    async fn upsert(&self, project: &Project) -> Result<(), StorageError>;
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn find_by_key(&self, key: &str) -> Result<Option<ApiKey>, StorageError>;
    async fn touch_last_used(&self, key: &str, at: DateTime<Utc>) -> Result<(), StorageError>;
    async fn upsert(&self, api_key: &ApiKey) -> Result<(), StorageError>;
    async fn revoke(&self, key: &str) -> Result<(), StorageError>;
}

#[async_trait]
pub trait OfflineQueueStore: Send + Sync {
    /// Persist an entry, returning its serial id.
    async fn enqueue(
        &self,
        agent_id: &str,
        kind: MessageKind,
        payload: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, StorageError>;
    /// All non-delivered, non-expired entries across all workers, oldest
    /// first.
    async fn load_pending(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>, StorageError>;
    async fn record_attempt(&self, serial: i64) -> Result<(), StorageError>;
    /// Mark delivered; a delivered entry is never resent.
    async fn mark_delivered(&self, serial: i64) -> Result<(), StorageError>;
    /// Drop entries past expiry. Returns the number removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError>;
}

#[async_trait]
pub trait ScheduleStore: Send + Sync {
    async fn create(&self, schedule: &Schedule) -> Result<(), StorageError>;
    async fn get(&self, id: &str) -> Result<Option<Schedule>, StorageError>;
    async fn update(&self, schedule: &Schedule) -> Result<(), StorageError>;
    /// Enabled, non-terminal schedules whose next execution is past due.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StorageError>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> Result<(), StorageError>;
}

/// Bundle of every repository, cloned freely across services.
#[derive(Clone)]
pub struct Storage {
    pub tasks: Arc<dyn TaskStore>,
    pub projects: Arc<dyn ProjectStore>,
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub offline: Arc<dyn OfflineQueueStore>,
    pub schedules: Arc<dyn ScheduleStore>,
    pub audit: Arc<dyn AuditLog>,
}

impl Storage {
    /// In-memory storage for tests and embedded runs.
    pub fn in_memory() -> Self {
        let backend = Arc::new(memory::MemoryBackend::default());
        Self {
            tasks: backend.clone(),
            projects: backend.clone(),
            api_keys: backend.clone(),
            offline: backend.clone(),
            schedules: backend.clone(),
            audit: backend,
        }
    }

    /// PostgreSQL-backed storage over a shared pool.
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        let backend = Arc::new(postgres::PgBackend::new(pool));
        Self {
            tasks: backend.clone(),
            projects: backend.clone(),
            api_keys: backend.clone(),
            offline: backend.clone(),
            schedules: backend.clone(),
            audit: backend,
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}
