/// Model registry using ArcSwap
///
/// Holds every loaded process definition keyed by model path (the file name).
/// Loading swaps the whole map, so readers never block and running instances
/// keep the `Arc<ProcessDefinition>` they started with.

use crate::workflow::{parser::parse_definition, types::ProcessDefinition};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, path::Path, sync::Arc};

/// A parsed model together with the document it came from
#[derive(Debug, Clone)]
pub struct LoadedModel {
    /// Shared, immutable process graph
    pub definition: Arc<ProcessDefinition>,
    /// Raw BPMN XML, served back by the model endpoint
    pub source: Arc<str>,
}

/// Lock-free registry of loaded process models
#[derive(Debug)]
pub struct ModelRegistry {
    /// Key: model_path (e.g. "order_approval.bpmn")
    models: ArcSwap<HashMap<String, LoadedModel>>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self {
            models: ArcSwap::new(Arc::new(HashMap::new())),
        }
    }

    /// Load every `*.bpmn` file of a directory
    ///
    /// A file that fails to parse is logged and skipped; it never prevents the
    /// other models from loading. Returns the number of models loaded.
    pub fn load_dir(&self, dir: impl AsRef<Path>) -> Result<usize> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir)
            .map_err(|e| anyhow::anyhow!("Failed to read models directory '{}': {}", dir.display(), e))?;

        let mut loaded = HashMap::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("bpmn") {
                continue;
            }
            let Some(model_path) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
                continue;
            };

            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(e) => {
                    tracing::error!("❌ Failed to read model {}: {}", path.display(), e);
                    continue;
                }
            };

            match parse_definition(&source, &model_path) {
                Ok(definition) => {
                    tracing::info!("📥 Loaded model: {}", model_path);
                    loaded.insert(
                        model_path,
                        LoadedModel {
                            definition: Arc::new(definition),
                            source: Arc::from(source),
                        },
                    );
                }
                Err(e) => tracing::error!("❌ Skipping model {}: {}", model_path, e),
            }
        }

        let count = loaded.len();
        let current = self.models.load();
        let mut next = (**current).clone();
        next.extend(loaded);
        self.models.store(Arc::new(next));

        tracing::info!("Initialized model registry with {} models from {}", count, dir.display());
        Ok(count)
    }

    /// Parse and register a single model from its source
    pub fn insert_source(&self, model_path: &str, source: &str) -> Result<Arc<ProcessDefinition>> {
        let definition = Arc::new(parse_definition(source, model_path)?);

        let current = self.models.load();
        let mut next = (**current).clone();
        next.insert(
            model_path.to_string(),
            LoadedModel {
                definition: Arc::clone(&definition),
                source: Arc::from(source),
            },
        );
        self.models.store(Arc::new(next));

        tracing::info!("Registered model: {}", model_path);
        Ok(definition)
    }

    /// Get a model by path (lock-free read)
    pub fn get(&self, model_path: &str) -> Option<LoadedModel> {
        self.models.load().get(model_path).cloned()
    }

    pub fn definition(&self, model_path: &str) -> Option<Arc<ProcessDefinition>> {
        self.get(model_path).map(|m| m.definition)
    }

    /// Sorted list of loaded model paths
    pub fn model_paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.models.load().keys().cloned().collect();
        paths.sort();
        paths
    }
}
