/// SQLite persistence layer for instance durability
///
/// Two tables:
/// - `events`: append-only step records (snapshots stored as JSON text,
///   timestamps as UTC microseconds)
/// - `running_instances`: registry read at startup to decide what to recover

use crate::persistence::store::{EventRecord, InstanceStore, RunningInstanceLog};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqliteRow},
    Row,
};
use std::path::Path;

/// SQLite-backed instance store
#[derive(Debug, Clone)]
pub struct SqliteInstanceStore {
    pool: SqlitePool,
}

impl SqliteInstanceStore {
    /// Open (or create) the database file and initialize the schema
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    anyhow::anyhow!("Failed to create data directory '{}': {}", parent.display(), e)
                })?;
            }
        }

        tracing::info!("🗄️ Opening instance database: {}", db_path.display());

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                model_path TEXT NOT NULL,
                activity_id TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                pending JSON NOT NULL,
                variables JSON NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS running_instances (
                instance_id TEXT PRIMARY KEY,
                model_path TEXT NOT NULL,
                running INTEGER NOT NULL DEFAULT 1,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_instance ON events(instance_id, timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn events_for(&self, instance_id: &str) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, model_path, activity_id, timestamp, pending, variables
            FROM events WHERE instance_id = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &SqliteRow) -> Result<EventRecord> {
    let micros: i64 = row.try_get("timestamp")?;
    let timestamp = DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| anyhow::anyhow!("Invalid event timestamp: {}", micros))?;
    let pending: String = row.try_get("pending")?;
    let variables: String = row.try_get("variables")?;

    Ok(EventRecord {
        instance_id: row.try_get("instance_id")?,
        model_path: row.try_get("model_path")?,
        activity_id: row.try_get("activity_id")?,
        timestamp,
        pending: serde_json::from_str(&pending)?,
        variables: serde_json::from_str(&variables)?,
    })
}

#[async_trait]
impl InstanceStore for SqliteInstanceStore {
    async fn append_event(&self, record: &EventRecord) -> Result<()> {
        let pending = serde_json::to_string(&record.pending)?;
        let variables = serde_json::to_string(&record.variables)?;

        sqlx::query(
            r#"
            INSERT INTO events (instance_id, model_path, activity_id, timestamp, pending, variables)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.instance_id)
        .bind(&record.model_path)
        .bind(&record.activity_id)
        .bind(record.timestamp.timestamp_micros())
        .bind(&pending)
        .bind(&variables)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn running_instances_log(&self) -> Result<Vec<RunningInstanceLog>> {
        let rows = sqlx::query(
            "SELECT instance_id, model_path FROM running_instances WHERE running = 1 ORDER BY created_at, instance_id",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut logs = Vec::with_capacity(rows.len());
        for row in rows {
            let instance_id: String = row.try_get("instance_id")?;
            let model_path: String = row.try_get("model_path")?;
            let events = self.events_for(&instance_id).await?;
            logs.push(RunningInstanceLog {
                instance_id,
                model_path,
                events,
            });
        }

        Ok(logs)
    }

    async fn register_running(&self, instance_id: &str, model_path: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO running_instances (instance_id, model_path, running)
            VALUES (?, ?, 1)
            ON CONFLICT(instance_id) DO UPDATE SET
                model_path = excluded.model_path,
                running = 1
            "#,
        )
        .bind(instance_id)
        .bind(model_path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_finished(&self, instance_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE running_instances SET running = 0 WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, instance_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM running_instances WHERE instance_id = ?")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn all_events(&self) -> Result<Vec<EventRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, model_path, activity_id, timestamp, pending, variables
            FROM events ORDER BY timestamp ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}
