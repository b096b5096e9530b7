/// Transport-agnostic service facade
///
/// Every operation the HTTP layer exposes lives here and returns
/// `EngineResult`, so handlers only translate results into responses.

use crate::error::{EngineError, EngineResult};
use crate::persistence::EventRecord;
use crate::runtime::{scheduler::InstanceScheduler, search, InstanceHandle};
use crate::workflow::registry::ModelRegistry;
use serde_json::{json, Map, Value};
use std::sync::Arc;

#[derive(Clone)]
pub struct ProcessService {
    models: Arc<ModelRegistry>,
    scheduler: Arc<InstanceScheduler>,
}

impl ProcessService {
    pub fn new(models: Arc<ModelRegistry>, scheduler: Arc<InstanceScheduler>) -> Self {
        Self { models, scheduler }
    }

    pub fn models(&self) -> &Arc<ModelRegistry> {
        &self.models
    }

    pub fn scheduler(&self) -> &Arc<InstanceScheduler> {
        &self.scheduler
    }

    /// Loaded models with the ids of their live instances
    pub fn list_models(&self) -> EngineResult<Vec<Value>> {
        let models = self
            .models
            .model_paths()
            .into_iter()
            .filter_map(|path| {
                let definition = self.models.definition(&path)?;
                Some(json!({
                    "model_path": path,
                    "id": definition.id,
                    "name": definition.name,
                    "instances": self.scheduler.instance_ids_for(&path),
                }))
            })
            .collect();
        Ok(models)
    }

    /// Raw BPMN document of a model
    pub fn model_source(&self, model_name: &str) -> EngineResult<Arc<str>> {
        self.models
            .get(model_name)
            .map(|m| m.source)
            .ok_or_else(|| EngineError::NotFound(format!("model '{}'", model_name)))
    }

    /// Start a new instance of a model; returns its id
    pub async fn create_instance(
        &self,
        model_name: &str,
        variables: Option<Map<String, Value>>,
    ) -> EngineResult<String> {
        let definition = self
            .models
            .definition(model_name)
            .ok_or_else(|| EngineError::NotFound(format!("model '{}'", model_name)))?;

        let handle = self.scheduler.create(definition, variables.unwrap_or_default()).await?;
        Ok(handle.id.clone())
    }

    /// Deliver form fields to a user task waiting in an instance
    pub fn submit_form(&self, instance_id: &str, task_id: &str, fields: Map<String, Value>) -> EngineResult<()> {
        self.instance(instance_id)?.submit_form(task_id, fields)
    }

    /// Full serializations of the instances matching a query, sorted by id
    pub async fn search(&self, query: &str) -> EngineResult<Vec<Value>> {
        let terms = search::parse_query(query)?;

        let snapshots: Vec<_> = self.scheduler.handles().iter().map(|h| h.snapshot()).collect();
        let ids = search::matching_ids(&terms, snapshots.iter().map(|s| s.as_ref()));

        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(handle) = self.scheduler.get(&id) {
                results.push(handle.to_json().await);
            }
        }
        Ok(results)
    }

    pub async fn instance_info(&self, instance_id: &str) -> EngineResult<Value> {
        Ok(self.instance(instance_id)?.to_json().await)
    }

    /// Description of one element of an instance's model
    pub fn task_info(&self, instance_id: &str, task_id: &str) -> EngineResult<Value> {
        let handle = self.instance(instance_id)?;
        let element = handle
            .definition
            .element(task_id)
            .ok_or_else(|| EngineError::NotFound(format!("task '{}' in instance '{}'", task_id, instance_id)))?;

        let mut info = element.describe();
        info["instance_id"] = json!(instance_id);
        info["pending"] = json!(handle.snapshot().pending.iter().any(|t| t == task_id));
        Ok(info)
    }

    /// Stop an instance and remove it from the running registry
    ///
    /// Known either live or in the store is enough; unknown everywhere is
    /// `NotFound`.
    pub async fn delete_instance(&self, instance_id: &str) -> EngineResult<()> {
        let live = self.scheduler.cancel(instance_id).await.is_some();
        let stored = self
            .scheduler
            .manager()
            .store()
            .delete(instance_id)
            .await
            .map_err(EngineError::persistence)?;

        if !live && !stored {
            return Err(EngineError::NotFound(format!("instance '{}'", instance_id)));
        }

        tracing::info!("🗑️ Deleted instance {}", instance_id);
        Ok(())
    }

    pub async fn all_events(&self) -> EngineResult<Vec<EventRecord>> {
        self.scheduler
            .manager()
            .store()
            .all_events()
            .await
            .map_err(EngineError::persistence)
    }

    fn instance(&self, instance_id: &str) -> EngineResult<Arc<InstanceHandle>> {
        self.scheduler
            .get(instance_id)
            .ok_or_else(|| EngineError::NotFound(format!("instance '{}'", instance_id)))
    }
}
