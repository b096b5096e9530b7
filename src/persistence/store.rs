/// Persistence contract for instance durability
///
/// The append-only event log is the only recovery source of truth. The
/// running-instance registry records which instances must be reconstructed
/// when the process starts again.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One executed step of one instance
///
/// `pending` and `variables` are snapshots taken immediately after the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub instance_id: String,
    pub model_path: String,
    /// Element id of the token processed by this step
    pub activity_id: String,
    pub timestamp: DateTime<Utc>,
    pub pending: Vec<String>,
    pub variables: Map<String, Value>,
}

impl EventRecord {
    /// Shape embedded in instance serializations
    pub fn to_step_json(&self) -> Value {
        serde_json::json!({
            "activity_id": self.activity_id,
            "pending": self.pending,
            "variables": self.variables,
            "timestamp": self.timestamp,
        })
    }
}

/// A registry entry still flagged running, with its ordered event log
#[derive(Debug, Clone)]
pub struct RunningInstanceLog {
    pub instance_id: String,
    pub model_path: String,
    /// Ordered by timestamp ascending
    pub events: Vec<EventRecord>,
}

/// Durable store for event records and the running-instance registry
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Append one step record; this is the durability boundary of a step
    async fn append_event(&self, record: &EventRecord) -> Result<()>;

    /// Every instance still flagged running, with its events in order
    async fn running_instances_log(&self) -> Result<Vec<RunningInstanceLog>>;

    /// Register a new instance as running
    async fn register_running(&self, instance_id: &str, model_path: &str) -> Result<()>;

    /// Flag an instance as no longer running; false when the id is unknown
    async fn mark_finished(&self, instance_id: &str) -> Result<bool>;

    /// Remove an instance from the registry; false when the id is unknown
    async fn delete(&self, instance_id: &str) -> Result<bool>;

    /// Every stored event, ordered by timestamp
    async fn all_events(&self) -> Result<Vec<EventRecord>>;
}
