//! Registry of loaded model instances.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{ModelInstance, ModelStatus};

/// Stores model instances by id. Instances are mutated only through the
/// registry, under its lock.
pub struct Registry {
    models: RwLock<HashMap<String, ModelInstance>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            models: RwLock::new(HashMap::new()),
        }
    }

    pub fn set(&self, instance: ModelInstance) {
        let mut models = self.models.write().expect("model registry lock poisoned");
        models.insert(instance.id.clone(), instance);
    }

    pub fn get(&self, id: &str) -> Option<ModelInstance> {
        let models = self.models.read().expect("model registry lock poisoned");
        models.get(id).cloned()
    }

    pub fn list(&self) -> Vec<ModelInstance> {
        let models = self.models.read().expect("model registry lock poisoned");
        models.values().cloned().collect()
    }

    pub fn delete(&self, id: &str) {
        let mut models = self.models.write().expect("model registry lock poisoned");
        models.remove(id);
    }

    pub fn set_status(&self, id: &str, status: ModelStatus) {
        let mut models = self.models.write().expect("model registry lock poisoned");
        if let Some(instance) = models.get_mut(id) {
            instance.set_status(status);
        }
    }

    /// Record that a backend has the model resident. Only the first
    /// successful use stamps `loaded_at`.
    pub fn mark_loaded(&self, id: &str) {
        let mut models = self.models.write().expect("model registry lock poisoned");
        if let Some(instance) = models.get_mut(id) {
            if instance.status != ModelStatus::Loaded {
                instance.set_status(ModelStatus::Loaded);
            }
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, ModelType, SourceConfig};
    use std::path::PathBuf;

    fn instance(id: &str) -> ModelInstance {
        ModelInstance::new(
            id.to_string(),
            PathBuf::from(format!("/models/{id}")),
            ModelConfig {
                model_type: ModelType::Llm,
                backend: "llama.cpp".to_string(),
                source: SourceConfig::default(),
                order: 0,
                tags: Vec::new(),
            },
        )
    }

    #[test]
    fn set_get_list_delete() {
        let registry = Registry::new();
        registry.set(instance("a"));
        registry.set(instance("b"));

        assert!(registry.get("a").is_some());
        assert_eq!(registry.list().len(), 2);

        registry.delete("a");
        assert!(registry.get("a").is_none());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn status_transitions_apply_under_the_lock() {
        let registry = Registry::new();
        registry.set(instance("a"));

        registry.set_status("a", ModelStatus::Loaded);
        let got = registry.get("a").unwrap();
        assert_eq!(got.status, ModelStatus::Loaded);
        assert!(got.loaded_at.is_some());
    }

    #[test]
    fn mark_loaded_keeps_the_first_timestamp() {
        let registry = Registry::new();
        registry.set(instance("a"));

        registry.mark_loaded("a");
        let first = registry.get("a").unwrap().loaded_at.unwrap();

        registry.mark_loaded("a");
        assert_eq!(registry.get("a").unwrap().loaded_at.unwrap(), first);

        // Unknown ids are a no-op.
        registry.mark_loaded("ghost");
        assert!(registry.get("ghost").is_none());
    }
}
