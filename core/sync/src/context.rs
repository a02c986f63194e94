//! Process-wide offline context.
//!
//! Owns the shared Local Store, the identifier dependency graph, the
//! translation map and the registry of services by name. Create one at
//! startup and [`OfflineContext::reset`] it on logout or test teardown.

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use offlinekit_common::{DatabaseName, Error, Key, Result};
use offlinekit_storage::{EngineRegistry, StorageEngine};

use crate::migration::LogicalSchema;
use crate::reconcile::{DependencyGraph, TranslationMap};
use crate::service::OfflineService;
use crate::store::LocalStore;

/// Which engine backs a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Registered engine name.
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Engine specific configuration.
    #[serde(default)]
    pub engine_config: Value,
}

fn default_engine() -> String {
    "memory".to_string()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            engine_config: Value::Null,
        }
    }
}

/// What [`OfflineContext::translate_identifier`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Translation {
    /// The row itself moved to the online key.
    pub rekeyed: bool,
    /// Dependent rows whose foreign key was rewritten.
    pub patched: usize,
    /// Dependencies skipped because their service is not registered.
    pub skipped: usize,
}

/// Shared state of every offline service in the process.
pub struct OfflineContext {
    store: Arc<LocalStore>,
    graph: Arc<DependencyGraph>,
    translations: Arc<TranslationMap>,
    services: RwLock<HashMap<String, Arc<OfflineService>>>,
}

impl OfflineContext {
    /// Create a context over an engine.
    pub fn new(engine: Arc<dyn StorageEngine>) -> Result<Self> {
        let store = Arc::new(LocalStore::new(engine));
        Ok(Self {
            graph: Arc::new(DependencyGraph::new(store.clone())?),
            store,
            translations: Arc::new(TranslationMap::new()),
            services: RwLock::new(HashMap::new()),
        })
    }

    /// Create a context over the engine named by `config`.
    ///
    /// # Errors
    /// - Engine is not registered
    /// - Engine configuration is invalid
    pub fn from_config(registry: &EngineRegistry, config: &ContextConfig) -> Result<Self> {
        let engine = registry.resolve(&config.engine, config.engine_config.clone())?;
        info!("Offline context using '{}' engine", engine.name());
        Self::new(engine)
    }

    /// The shared Local Store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// The identifier dependency graph.
    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    /// The identifier translation map.
    pub fn translations(&self) -> &Arc<TranslationMap> {
        &self.translations
    }

    /// Register a service and its logical schema.
    ///
    /// # Errors
    /// - `AlreadyExists` when the name is taken
    /// - `InvalidInput` when the name is not a valid database name
    pub async fn register_service(
        &self,
        name: impl Into<String>,
        schema: LogicalSchema,
    ) -> Result<Arc<OfflineService>> {
        let name = name.into();
        let mut services = self.services.write().await;
        if services.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Service '{}' is already registered",
                name
            )));
        }

        let service = Arc::new(OfflineService::new(
            name.clone(),
            schema,
            self.store.clone(),
            self.graph.clone(),
            self.translations.clone(),
        )?);
        services.insert(name.clone(), service.clone());
        debug!("Registered offline service '{}'", name);
        Ok(service)
    }

    /// Look up a service by name.
    pub async fn service(&self, name: &str) -> Option<Arc<OfflineService>> {
        self.services.read().await.get(name).cloned()
    }

    /// Names of registered services, sorted.
    pub async fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Replace an offline identifier by the one the backend assigned.
    ///
    /// The translation map learns the mapping first. Then the row moves to
    /// `online`, every recorded dependent has its foreign key rewritten
    /// without journaling, dependencies held by the moved row follow it, and
    /// the dependency record is discarded. Translating again is a no-op.
    ///
    /// # Errors
    /// - `ReconciliationLookup` when `service_name` is not registered
    /// - Storage failures of the owning service; dependents whose service
    ///   cannot be resolved are skipped and logged instead
    pub async fn translate_identifier(
        &self,
        offline: &str,
        online: Key,
        table: &str,
        service_name: &str,
    ) -> Result<Translation> {
        self.translations.insert(offline, online.clone());

        let owner = self.service(service_name).await.ok_or_else(|| {
            Error::ReconciliationLookup(format!("Service '{}' is not registered", service_name))
        })?;
        let offline_key = Key::from(offline);
        let mut translation = Translation {
            rekeyed: owner.rekey_row(table, &offline_key, &online).await?,
            ..Translation::default()
        };

        if let Some(record) = self.graph.record(offline).await? {
            for dependency in &record.dependencies {
                let Some(service) = self.service(&dependency.service_name).await else {
                    warn!(
                        "Skipping dependency {}.{} of {}: service '{}' is not registered",
                        dependency.table_name,
                        dependency.foreign_key_name,
                        offline,
                        dependency.service_name
                    );
                    translation.skipped += 1;
                    continue;
                };
                let patched = service
                    .patch_foreign_key(
                        &dependency.table_name,
                        &dependency.primary_key,
                        &dependency.foreign_key_name,
                        offline,
                        &online,
                    )
                    .await?;
                if patched {
                    translation.patched += 1;
                }
            }
        }

        self.graph
            .rekey_dependents(service_name, table, &offline_key, &online)
            .await?;
        self.graph.forget(offline).await?;

        info!(
            "Translated {} to {} in '{}.{}', {} dependents patched",
            offline, online, service_name, table, translation.patched
        );
        Ok(translation)
    }

    /// Delete one database, through its service when registered.
    pub async fn delete_database(&self, name: &str) -> Result<()> {
        match self.service(name).await {
            Some(service) => service.delete_database().await,
            None => self.store.delete(&DatabaseName::new(name)?).await,
        }
    }

    /// Empty the tables of every registered service.
    pub async fn clear_all_tables(&self) -> Result<()> {
        let services: Vec<Arc<OfflineService>> = self.services.read().await.values().cloned().collect();
        try_join_all(services.iter().map(|s| s.clear_all_tables())).await?;
        info!("Cleared tables of {} services", services.len());
        Ok(())
    }

    /// Delete every service database and the dependency database, and
    /// forget every service and translation.
    pub async fn reset(&self) -> Result<()> {
        let services: Vec<Arc<OfflineService>> = {
            let mut registry = self.services.write().await;
            registry.drain().map(|(_, service)| service).collect()
        };

        try_join_all(services.iter().map(|s| s.delete_database())).await?;
        self.store.delete(self.graph.database_name()).await?;
        self.graph.reset().await;
        self.translations.clear();

        info!("Reset offline context, deleted {} service databases", services.len());
        Ok(())
    }
}

impl std::fmt::Debug for OfflineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineContext")
            .field("engine", &self.store.engine().name())
            .field("translations", &self.translations.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::LogicalTable;
    use crate::query::Selector;
    use offlinekit_common::Row;
    use offlinekit_storage::{create_default_registry, MemoryEngine};
    use serde_json::json;
    use tempfile::TempDir;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn context() -> OfflineContext {
        OfflineContext::new(Arc::new(MemoryEngine::new())).unwrap()
    }

    async fn shop(context: &OfflineContext) -> (Arc<OfflineService>, Arc<OfflineService>) {
        let customers = context
            .register_service(
                "customers",
                LogicalSchema::new().table("Customer", LogicalTable::new("id").indexes(["name"])),
            )
            .await
            .unwrap();
        let orders = context
            .register_service(
                "orders",
                LogicalSchema::new().table(
                    "Order",
                    LogicalTable::new("id")
                        .indexes(["customerId"])
                        .foreign_keys(["customerId"]),
                ),
            )
            .await
            .unwrap();
        (customers, orders)
    }

    fn id_of(row: &Row) -> String {
        row["id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_register_service_rejects_duplicates() {
        let context = context();
        shop(&context).await;
        let result = context.register_service("orders", LogicalSchema::new()).await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
        assert_eq!(context.services().await, vec!["customers", "orders"]);
    }

    #[tokio::test]
    async fn test_translation_rewrites_row_and_dependents() {
        let context = context();
        let (customers, orders) = shop(&context).await;

        let customer = customers
            .create_local("Customer", vec![row(json!({"name": "Ada"}))], None)
            .await
            .unwrap();
        let u2 = id_of(&customer[0]);
        let order = orders
            .create_local("Order", vec![row(json!({"customerId": u2, "total": 12}))], None)
            .await
            .unwrap();
        let u1 = id_of(&order[0]);

        let translation = context
            .translate_identifier(&u2, Key::from("c42"), "Customer", "customers")
            .await
            .unwrap();
        assert!(translation.rekeyed);
        assert_eq!(translation.patched, 1);

        let moved = customers
            .fetch_rows(&Selector::new("Customer").with("id", "c42"))
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0]["name"], json!("Ada"));
        assert!(customers
            .fetch_rows(&Selector::new("Customer").with("id", u2.clone()))
            .await
            .unwrap()
            .is_empty());

        let order = orders
            .fetch_rows(&Selector::new("Order").with("id", u1))
            .await
            .unwrap();
        assert_eq!(order[0]["customerId"], json!("c42"));
        assert_eq!(order[0]["total"], json!(12));

        // The rewrite is not journaled as a mutation.
        assert_eq!(orders.read_pending().await.unwrap().len(), 1);
        assert!(context.graph().record(&u2).await.unwrap().is_none());
        assert_eq!(context.translations().get(&u2), Some(Key::from("c42")));

        let again = context
            .translate_identifier(&u2, Key::from("c42"), "Customer", "customers")
            .await
            .unwrap();
        assert_eq!(again, Translation::default());
    }

    #[tokio::test]
    async fn test_dependents_follow_their_rekeyed_row() {
        let context = context();
        let (customers, orders) = shop(&context).await;

        let customer = customers
            .create_local("Customer", vec![row(json!({"name": "Bo"}))], None)
            .await
            .unwrap();
        let u2 = id_of(&customer[0]);
        let order = orders
            .create_local("Order", vec![row(json!({"customerId": u2}))], None)
            .await
            .unwrap();
        let u1 = id_of(&order[0]);

        // The order is accepted first, then the customer.
        context
            .translate_identifier(&u1, Key::from(900i64), "Order", "orders")
            .await
            .unwrap();
        let translation = context
            .translate_identifier(&u2, Key::from("c7"), "Customer", "customers")
            .await
            .unwrap();
        assert_eq!(translation.patched, 1);

        let order = orders
            .fetch_rows(&Selector::new("Order").with("id", 900))
            .await
            .unwrap();
        assert_eq!(order[0]["id"], json!(900));
        assert_eq!(order[0]["customerId"], json!("c7"));
    }

    #[tokio::test]
    async fn test_unresolvable_dependency_service_is_skipped() {
        let context = context();
        let (customers, _) = shop(&context).await;

        let customer = customers
            .create_local("Customer", vec![row(json!({"name": "Cy"}))], None)
            .await
            .unwrap();
        let u2 = id_of(&customer[0]);
        context
            .graph()
            .register(
                "invoices",
                "Invoice",
                "id",
                &["customerId".to_string()],
                &[row(json!({"id": 1, "customerId": u2}))],
            )
            .await
            .unwrap();

        let translation = context
            .translate_identifier(&u2, Key::from("c1"), "Customer", "customers")
            .await
            .unwrap();
        assert!(translation.rekeyed);
        assert_eq!(translation.skipped, 1);

        let missing = context
            .translate_identifier("x", Key::from("y"), "Customer", "nobody")
            .await;
        assert!(matches!(missing, Err(Error::ReconciliationLookup(_))));
    }

    #[tokio::test]
    async fn test_reset_deletes_everything() {
        let context = context();
        let (customers, orders) = shop(&context).await;
        customers
            .create_local("Customer", vec![row(json!({"name": "Di"}))], None)
            .await
            .unwrap();
        orders.initialize().await.unwrap();
        context.translations().insert("a", Key::from("b"));
        assert_eq!(context.store().databases().await.unwrap().len(), 3);

        context.reset().await.unwrap();
        assert!(context.store().databases().await.unwrap().is_empty());
        assert!(context.services().await.is_empty());
        assert!(context.translations().is_empty());
        assert!(context.graph().records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clear_and_delete_database() {
        let context = context();
        let (customers, _) = shop(&context).await;
        customers
            .create_local("Customer", vec![row(json!({"id": "k", "name": "Ed"}))], None)
            .await
            .unwrap();

        context.clear_all_tables().await.unwrap();
        assert!(customers
            .fetch_rows(&Selector::new("Customer"))
            .await
            .unwrap()
            .is_empty());

        context.delete_database("customers").await.unwrap();
        assert!(!context
            .store()
            .databases()
            .await
            .unwrap()
            .contains(&"customers".to_string()));
        // Unregistered names are deleted directly.
        context.delete_database("never-opened").await.unwrap();
    }

    #[tokio::test]
    async fn test_from_config() {
        let registry = create_default_registry();
        let context = OfflineContext::from_config(&registry, &ContextConfig::default()).unwrap();
        assert_eq!(context.store().engine().name(), "memory");

        let dir = TempDir::new().unwrap();
        let config: ContextConfig = serde_json::from_value(json!({
            "engine": "sqlite",
            "engine_config": {"root": dir.path()}
        }))
        .unwrap();
        let context = OfflineContext::from_config(&registry, &config).unwrap();
        let (customers, _) = shop(&context).await;
        customers
            .create_local("Customer", vec![row(json!({"id": "k"}))], None)
            .await
            .unwrap();
        assert!(dir.path().join("customers.db").exists());

        let unknown = ContextConfig {
            engine: "nope".to_string(),
            engine_config: Value::Null,
        };
        assert!(matches!(
            OfflineContext::from_config(&registry, &unknown),
            Err(Error::NotFound(_))
        ));
    }
}
