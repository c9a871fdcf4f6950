use crate::runtime::engine::ProcessEngine;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// Named collection of engines. An explicit object rather than process-wide
/// state, so tests and embedders can hold several isolated registries.
#[derive(Default)]
pub struct EngineRegistry {
    engines: DashMap<String, Arc<ProcessEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, engine: ProcessEngine) -> Arc<ProcessEngine> {
        let engine = Arc::new(engine);
        info!(engine = %name, "registering engine");
        self.engines.insert(name.to_string(), engine.clone());
        engine
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProcessEngine>> {
        self.engines.get(name).map(|e| e.clone())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<ProcessEngine>> {
        self.engines.remove(name).map(|(_, e)| e)
    }

    pub fn names(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.key().clone()).collect()
    }

    /// Closes every registered engine and empties the registry.
    pub fn close_all(&self) {
        for entry in self.engines.iter() {
            entry.value().close();
        }
        self.engines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_get_remove() {
        let registry = EngineRegistry::new();
        registry.register("default", ProcessEngine::new());
        assert!(registry.get("default").is_some());
        assert_eq!(registry.names(), vec!["default".to_string()]);
        assert!(registry.remove("default").is_some());
        assert!(registry.get("default").is_none());
    }
}
