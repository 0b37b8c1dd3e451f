//! PostgreSQL storage backend.
//!
//! Rows keep the queried fields in columns and the full record as a JSONB
//! document, so the schema stays stable while the domain types evolve.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::Row;

use super::{
    ApiKeyStore, AuditEntry, AuditLog, OfflineQueueStore, ProjectStore, QueuedMessage,
    ScheduleStore, StorageError, TaskStore,
};
use crate::domain::{ApiKey, Project, Schedule, Task};
use foreman_protocol::MessageKind;

/// DDL applied at boot; idempotent.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    parent_task_id TEXT,
    status TEXT NOT NULL,
    terminal BOOLEAN NOT NULL DEFAULT FALSE,
    completed_at TIMESTAMPTZ,
    data JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS tasks_parent_idx ON tasks (parent_task_id);

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    channel_id TEXT NOT NULL UNIQUE,
    data JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS api_keys (
    key TEXT PRIMARY KEY,
    data JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS offline_queue (
    serial BIGSERIAL PRIMARY KEY,
    agent_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload JSONB NOT NULL,
    queued_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    delivered BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE INDEX IF NOT EXISTS offline_queue_pending_idx
    ON offline_queue (delivered, expires_at);

CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    next_run_at TIMESTAMPTZ,
    enabled BOOLEAN NOT NULL,
    status TEXT NOT NULL,
    data JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_log (
    id TEXT PRIMARY KEY,
    at TIMESTAMPTZ NOT NULL,
    data JSONB NOT NULL
);
"#;

/// PostgreSQL-backed implementation of every store.
pub struct PgBackend {
    pool: PgPool,
}

impl PgBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema. Called once at boot.
    pub async fn ensure_schema(&self) -> Result<(), StorageError> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, StorageError> {
    Ok(serde_json::from_value(value)?)
}

#[async_trait]
impl TaskStore for PgBackend {
    async fn create(&self, task: &Task) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO tasks (id, parent_task_id, status, terminal, completed_at, data)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&task.id)
        .bind(&task.parent_task_id)
        .bind(task.status.to_string())
        .bind(task.is_terminal())
        .bind(task.completed_at)
        .bind(serde_json::to_value(task)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>, StorageError> {
        let row = sqlx::query("SELECT data FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode(r.get::<serde_json::Value, _>("data")))
            .transpose()
    }

    async fn update(&self, task: &Task) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE tasks
             SET parent_task_id = $2, status = $3, terminal = $4, completed_at = $5, data = $6
             WHERE id = $1",
        )
        .bind(&task.id)
        .bind(&task.parent_task_id)
        .bind(task.status.to_string())
        .bind(task.is_terminal())
        .bind(task.completed_at)
        .bind(serde_json::to_value(task)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(task.id.clone()));
        }
        Ok(())
    }

    async fn find_by_parent(&self, parent_id: &str) -> Result<Vec<Task>, StorageError> {
        let rows = sqlx::query("SELECT data FROM tasks WHERE parent_task_id = $1 ORDER BY id")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|r| decode(r.get::<serde_json::Value, _>("data")))
            .collect()
    }

    async fn all_subtasks_terminal(&self, parent_id: &str) -> Result<bool, StorageError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE terminal) AS done
             FROM tasks WHERE parent_task_id = $1",
        )
        .bind(parent_id)
        .fetch_one(&self.pool)
        .await?;
        let total: i64 = row.get("total");
        let done: i64 = row.get("done");
        Ok(total > 0 && total == done)
    }

    async fn delete_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM tasks WHERE terminal AND completed_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ProjectStore for PgBackend {
    async fn get(&self, id: &str) -> Result<Option<Project>, StorageError> {
        let row = sqlx::query("SELECT data FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode(r.get::<serde_json::Value, _>("data")))
            .transpose()
    }

    async fn find_by_channel(&self, channel_id: &str) -> Result<Option<Project>, StorageError> {
        let row = sqlx::query("SELECT data FROM projects WHERE channel_id = $1")
            .bind(channel_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode(r.get::<serde_json::Value, _>("data")))
            .transpose()
    }

    async fn upsert(&self, project: &Project) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO projects (id, channel_id, data) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET channel_id = $2, data = $3",
        )
        .bind(&project.id)
        .bind(&project.channel_id)
        .bind(serde_json::to_value(project)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ApiKeyStore for PgBackend {
    async fn find_by_key(&self, key: &str) -> Result<Option<ApiKey>, StorageError> {
        let row = sqlx::query("SELECT data FROM api_keys WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode(r.get::<serde_json::Value, _>("data")))
            .transpose()
    }

    async fn touch_last_used(&self, key: &str, at: DateTime<Utc>) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE api_keys SET data = jsonb_set(data, '{last_used_at}', to_jsonb($2::timestamptz))
             WHERE key = $1",
        )
        .bind(key)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert(&self, api_key: &ApiKey) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO api_keys (key, data) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET data = $2",
        )
        .bind(&api_key.key)
        .bind(serde_json::to_value(api_key)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke(&self, key: &str) -> Result<(), StorageError> {
        let result =
            sqlx::query("UPDATE api_keys SET data = jsonb_set(data, '{revoked}', 'true') WHERE key = $1")
                .bind(key)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(key.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OfflineQueueStore for PgBackend {
    async fn enqueue(
        &self,
        agent_id: &str,
        kind: MessageKind,
        payload: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let row = sqlx::query(
            "INSERT INTO offline_queue (agent_id, kind, payload, queued_at, expires_at)
             VALUES ($1, $2, $3, $4, $5) RETURNING serial",
        )
        .bind(agent_id)
        .bind(kind.as_str())
        .bind(payload)
        .bind(Utc::now())
        .bind(expires_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("serial"))
    }

    async fn load_pending(&self, now: DateTime<Utc>) -> Result<Vec<QueuedMessage>, StorageError> {
        let rows = sqlx::query(
            "SELECT serial, agent_id, kind, payload, queued_at, expires_at, attempts, delivered
             FROM offline_queue
             WHERE NOT delivered AND expires_at > $1
             ORDER BY serial",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| {
                let kind: String = r.get("kind");
                let kind: MessageKind = kind
                    .parse()
                    .map_err(|e: foreman_protocol::ProtocolError| {
                        StorageError::Corrupt(e.to_string())
                    })?;
                Ok(QueuedMessage {
                    serial: r.get("serial"),
                    agent_id: r.get("agent_id"),
                    kind,
                    payload: r.get("payload"),
                    queued_at: r.get("queued_at"),
                    expires_at: r.get("expires_at"),
                    attempts: r.get::<i32, _>("attempts") as u32,
                    delivered: r.get("delivered"),
                })
            })
            .collect()
    }

    async fn record_attempt(&self, serial: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE offline_queue SET attempts = attempts + 1 WHERE serial = $1")
            .bind(serial)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_delivered(&self, serial: i64) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE offline_queue SET delivered = TRUE WHERE serial = $1")
            .bind(serial)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(serial.to_string()));
        }
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM offline_queue WHERE expires_at <= $1 OR delivered")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ScheduleStore for PgBackend {
    async fn create(&self, schedule: &Schedule) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO schedules (id, next_run_at, enabled, status, data)
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&schedule.id)
        .bind(schedule.next_run_at)
        .bind(schedule.enabled)
        .bind(serde_json::to_value(schedule.status)?.as_str().unwrap_or("pending").to_string())
        .bind(serde_json::to_value(schedule)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Schedule>, StorageError> {
        let row = sqlx::query("SELECT data FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| decode(r.get::<serde_json::Value, _>("data")))
            .transpose()
    }

    async fn update(&self, schedule: &Schedule) -> Result<(), StorageError> {
        let result = sqlx::query(
            "UPDATE schedules SET next_run_at = $2, enabled = $3, status = $4, data = $5
             WHERE id = $1",
        )
        .bind(&schedule.id)
        .bind(schedule.next_run_at)
        .bind(schedule.enabled)
        .bind(serde_json::to_value(schedule.status)?.as_str().unwrap_or("pending").to_string())
        .bind(serde_json::to_value(schedule)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(schedule.id.clone()));
        }
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StorageError> {
        let rows = sqlx::query(
            "SELECT data FROM schedules
             WHERE enabled
               AND status NOT IN ('completed', 'failed', 'cancelled', 'paused')
               AND next_run_at IS NOT NULL AND next_run_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|r| decode(r.get::<serde_json::Value, _>("data")))
            .collect()
    }
}

#[async_trait]
impl AuditLog for PgBackend {
    async fn append(&self, entry: AuditEntry) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO audit_log (id, at, data) VALUES ($1, $2, $3)")
            .bind(&entry.id)
            .bind(entry.at)
            .bind(serde_json::to_value(&entry)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
