/// Postgres persistence layer
///
/// Same two tables as the SQLite store (`events`, `running_instances`) so a
/// deployment can move between providers without changing recovery semantics.

use crate::config::PostgresConfig;
use crate::persistence::store::{EventRecord, InstanceStore, RunningInstanceLog};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow},
    Row,
};

/// Postgres-backed instance store
#[derive(Debug, Clone)]
pub struct PostgresInstanceStore {
    pool: PgPool,
}

/// Translate configuration into sqlx connect options
pub fn connect_options(config: &PostgresConfig) -> PgConnectOptions {
    let options = PgConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .database(&config.database);

    if config.password.is_empty() {
        options
    } else {
        options.password(&config.password)
    }
}

impl PostgresInstanceStore {
    /// Connect and initialize the schema
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        tracing::info!(
            "🐘 Connecting to Postgres {}@{}:{}/{}",
            config.user,
            config.host,
            config.port,
            config.database
        );

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options(config))
            .await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id BIGSERIAL PRIMARY KEY,
                instance_id TEXT NOT NULL,
                model_path TEXT NOT NULL,
                activity_id TEXT NOT NULL,
                timestamp BIGINT NOT NULL,
                pending TEXT NOT NULL,
                variables TEXT NOT NULL
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
                running BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
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
            FROM events WHERE instance_id = $1
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: &PgRow) -> Result<EventRecord> {
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
impl InstanceStore for PostgresInstanceStore {
    async fn append_event(&self, record: &EventRecord) -> Result<()> {
        let pending = serde_json::to_string(&record.pending)?;
        let variables = serde_json::to_string(&record.variables)?;

        sqlx::query(
            r#"
            INSERT INTO events (instance_id, model_path, activity_id, timestamp, pending, variables)
            VALUES ($1, $2, $3, $4, $5, $6)
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
            "SELECT instance_id, model_path FROM running_instances WHERE running ORDER BY created_at, instance_id",
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
            VALUES ($1, $2, TRUE)
            ON CONFLICT (instance_id) DO UPDATE SET
                model_path = EXCLUDED.model_path,
                running = TRUE
            "#,
        )
        .bind(instance_id)
        .bind(model_path)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_finished(&self, instance_id: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE running_instances SET running = FALSE WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, instance_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM running_instances WHERE instance_id = $1")
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn connect_options_carry_configuration() {
        let config = PostgresConfig {
            host: "db.internal".to_string(),
            port: 6543,
            user: "engine".to_string(),
            password: "secret".to_string(),
            database: "processes".to_string(),
        };

        let options = connect_options(&config);
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_username(), "engine");
        assert_eq!(options.get_database(), Some("processes"));
    }

    /// Runs against a live server only when `BPMNWAY_TEST_POSTGRES_HOST` is set
    #[tokio::test]
    async fn registry_and_ordering_against_live_server() {
        let Ok(host) = std::env::var("BPMNWAY_TEST_POSTGRES_HOST") else {
            return;
        };
        let config = PostgresConfig {
            host,
            password: std::env::var("BPMNWAY_TEST_POSTGRES_PASSWORD").unwrap_or_default(),
            ..PostgresConfig::default()
        };
        let store = PostgresInstanceStore::connect(&config).await.unwrap();

        let id = uuid::Uuid::new_v4().to_string();
        let t0 = Utc::now();
        let record = |activity: &str, at: DateTime<Utc>| EventRecord {
            instance_id: id.clone(),
            model_path: "order.bpmn".to_string(),
            activity_id: activity.to_string(),
            timestamp: at,
            pending: vec![],
            variables: json!({"amount": 3}).as_object().cloned().unwrap(),
        };

        store.register_running(&id, "order.bpmn").await.unwrap();
        store.append_event(&record("Second", t0 + Duration::microseconds(5))).await.unwrap();
        store.append_event(&record("First", t0)).await.unwrap();

        let logs = store.running_instances_log().await.unwrap();
        let log = logs.iter().find(|l| l.instance_id == id).unwrap();
        let activities: Vec<&str> = log.events.iter().map(|e| e.activity_id.as_str()).collect();
        assert_eq!(activities, vec!["First", "Second"]);

        assert!(store.mark_finished(&id).await.unwrap());
        let logs = store.running_instances_log().await.unwrap();
        assert!(logs.iter().all(|l| l.instance_id != id));
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
    }
}
