/// Instance scheduler
///
/// Owns the process-wide map of live instances and runs every instance loop
/// as its own tokio task. At startup it rebuilds the instances the store
/// still lists as running and resumes them.

use crate::error::EngineResult;
use crate::runtime::instance::{InstanceHandle, InstanceManager, ProcessInstance};
use crate::workflow::{registry::ModelRegistry, types::ProcessDefinition};
use anyhow::Result;
use arc_swap::ArcSwap;
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::RwLock, task::JoinHandle};

pub struct InstanceScheduler {
    manager: Arc<InstanceManager>,
    /// Key: instance id. Updated by whole-map swap.
    instances: ArcSwap<HashMap<String, Arc<InstanceHandle>>>,
    tasks: RwLock<HashMap<String, JoinHandle<()>>>,
}

impl InstanceScheduler {
    pub fn new(manager: Arc<InstanceManager>) -> Self {
        Self {
            manager,
            instances: ArcSwap::from_pointee(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<InstanceManager> {
        &self.manager
    }

    /// Create an instance and schedule its run loop immediately
    pub async fn create(
        &self,
        definition: Arc<ProcessDefinition>,
        initial_variables: Map<String, Value>,
    ) -> EngineResult<Arc<InstanceHandle>> {
        let instance = self.manager.create_instance(definition, initial_variables).await?;
        Ok(self.spawn(instance).await)
    }

    /// Register an instance and run it on its own task
    pub async fn spawn(&self, instance: ProcessInstance) -> Arc<InstanceHandle> {
        let handle = instance.handle();
        let id = handle.id.clone();

        let entry = Arc::clone(&handle);
        self.instances.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(entry.id.clone(), Arc::clone(&entry));
            next
        });

        let task_id = id.clone();
        let join = tokio::spawn(async move {
            match instance.run().await {
                Ok(status) => tracing::debug!("Instance {} loop ended ({:?})", task_id, status),
                Err(e) => tracing::error!("❌ Instance {} stopped: {}", task_id, e),
            }
        });

        let mut tasks = self.tasks.write().await;
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(id, join);

        handle
    }

    /// Rebuild and resume every instance still registered as running
    ///
    /// Entries whose model is no longer loaded are skipped with a warning.
    /// Returns the number of resumed instances.
    pub async fn recover(&self, models: &ModelRegistry) -> Result<usize> {
        let logs = self.manager.store().running_instances_log().await?;
        tracing::info!("♻️ Recovering {} running instances", logs.len());

        let mut resumed = 0;
        for log in logs {
            let Some(definition) = models.definition(&log.model_path) else {
                tracing::warn!(
                    "⚠️ Skipping instance {}: model '{}' is not loaded",
                    log.instance_id,
                    log.model_path
                );
                continue;
            };

            let instance = self.manager.run_from_log(definition, &log.instance_id, log.events);
            self.spawn(instance).await;
            resumed += 1;
        }

        tracing::info!("✅ Resumed {} instances", resumed);
        Ok(resumed)
    }

    pub fn get(&self, instance_id: &str) -> Option<Arc<InstanceHandle>> {
        self.instances.load().get(instance_id).cloned()
    }

    /// Every live instance, sorted by id
    pub fn handles(&self) -> Vec<Arc<InstanceHandle>> {
        let mut handles: Vec<Arc<InstanceHandle>> = self.instances.load().values().cloned().collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    /// Ids of the live instances of one model, sorted
    pub fn instance_ids_for(&self, model_path: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .instances
            .load()
            .values()
            .filter(|h| h.definition.model_path == model_path)
            .map(|h| h.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Signal an instance to stop and forget it
    ///
    /// The loop exits at its next suspension point; a step in progress is
    /// never aborted.
    pub async fn cancel(&self, instance_id: &str) -> Option<Arc<InstanceHandle>> {
        let handle = self.get(instance_id)?;
        handle.cancel();

        self.instances.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(instance_id);
            next
        });
        self.tasks.write().await.remove(instance_id);

        tracing::info!("🗑️ Cancelled instance {}", instance_id);
        Some(handle)
    }
}
