//! Engine registry for resolving storage engines by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::engine::StorageEngine;
use offlinekit_common::{Error, Result};

/// Factory function type for creating engines from a JSON configuration.
pub type EngineFactory = Box<dyn Fn(Value) -> Result<Arc<dyn StorageEngine>> + Send + Sync>;

/// Registry for storage engine factories.
///
/// Allows dynamic registration and resolution of storage engines
/// by name and configuration.
pub struct EngineRegistry {
    factories: HashMap<String, EngineFactory>,
}

impl EngineRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register an engine factory.
    ///
    /// # Preconditions
    /// - `name` must be unique within the registry
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: EngineFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Engine '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve an engine by name and configuration.
    ///
    /// # Errors
    /// - Engine not found
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn StorageEngine>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Engine '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get the registered engine names, sorted.
    pub fn engines(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if an engine is registered.
    pub fn has_engine(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn sqlite_factory(config: Value) -> Result<Arc<dyn StorageEngine>> {
    let root = config
        .get("root")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::InvalidInput("SQLite engine requires 'root' path".to_string()))?;
    Ok(Arc::new(crate::sqlite::SqliteEngine::new(root)?))
}

/// Create a registry with the built-in engines: `memory` and `sqlite`.
pub fn create_default_registry() -> EngineRegistry {
    let mut factories: HashMap<String, EngineFactory> = HashMap::new();
    factories.insert(
        "memory".to_string(),
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryEngine::new()))),
    );
    factories.insert("sqlite".to_string(), Box::new(sqlite_factory));
    EngineRegistry { factories }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryEngine;
    use serde_json::json;

    #[test]
    fn test_register_and_resolve() {
        let mut registry = EngineRegistry::new();
        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryEngine::new()))))
            .unwrap();

        let engine = registry.resolve("test", Value::Null).unwrap();
        assert_eq!(engine.name(), "memory");
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = EngineRegistry::new();
        registry
            .register("test", Box::new(|_| Ok(Arc::new(MemoryEngine::new()))))
            .unwrap();

        let result = registry.register("test", Box::new(|_| Ok(Arc::new(MemoryEngine::new()))));
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[test]
    fn test_resolve_unknown_fails() {
        let registry = EngineRegistry::new();
        assert!(matches!(
            registry.resolve("unknown", Value::Null),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_default_registry() {
        let registry = create_default_registry();
        assert_eq!(registry.engines(), vec!["memory", "sqlite"]);
        assert!(registry.has_engine("sqlite"));

        assert!(matches!(
            registry.resolve("sqlite", json!({})),
            Err(Error::InvalidInput(_))
        ));

        let dir = tempfile::TempDir::new().unwrap();
        let engine = registry
            .resolve("sqlite", json!({"root": dir.path().to_str().unwrap()}))
            .unwrap();
        assert_eq!(engine.name(), "sqlite");
    }
}
