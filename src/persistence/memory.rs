/// In-memory instance store
///
/// Used when `BPMNWAY_STORAGE=memory` and by the test suite. Nothing survives
/// a restart.

use crate::persistence::store::{EventRecord, InstanceStore, RunningInstanceLog};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct RegistryEntry {
    instance_id: String,
    model_path: String,
    running: bool,
}

#[derive(Debug, Default)]
pub struct MemoryInstanceStore {
    events: RwLock<Vec<EventRecord>>,
    /// Insertion order is kept so recovery is deterministic
    registry: RwLock<Vec<RegistryEntry>>,
}

impl MemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn append_event(&self, record: &EventRecord) -> Result<()> {
        self.events.write().await.push(record.clone());
        Ok(())
    }

    async fn running_instances_log(&self) -> Result<Vec<RunningInstanceLog>> {
        let registry = self.registry.read().await;
        let events = self.events.read().await;

        let logs = registry
            .iter()
            .filter(|entry| entry.running)
            .map(|entry| {
                let mut records: Vec<EventRecord> = events
                    .iter()
                    .filter(|e| e.instance_id == entry.instance_id)
                    .cloned()
                    .collect();
                records.sort_by_key(|e| e.timestamp);
                RunningInstanceLog {
                    instance_id: entry.instance_id.clone(),
                    model_path: entry.model_path.clone(),
                    events: records,
                }
            })
            .collect();

        Ok(logs)
    }

    async fn register_running(&self, instance_id: &str, model_path: &str) -> Result<()> {
        let mut registry = self.registry.write().await;
        match registry.iter_mut().find(|e| e.instance_id == instance_id) {
            Some(entry) => {
                entry.model_path = model_path.to_string();
                entry.running = true;
            }
            None => registry.push(RegistryEntry {
                instance_id: instance_id.to_string(),
                model_path: model_path.to_string(),
                running: true,
            }),
        }
        Ok(())
    }

    async fn mark_finished(&self, instance_id: &str) -> Result<bool> {
        let mut registry = self.registry.write().await;
        match registry.iter_mut().find(|e| e.instance_id == instance_id) {
            Some(entry) => {
                entry.running = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, instance_id: &str) -> Result<bool> {
        let mut registry = self.registry.write().await;
        let before = registry.len();
        registry.retain(|e| e.instance_id != instance_id);
        Ok(registry.len() < before)
    }

    async fn all_events(&self) -> Result<Vec<EventRecord>> {
        let mut events = self.events.read().await.clone();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}
