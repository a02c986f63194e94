//! Reconciliation Engine state: which offline-minted identifiers exist,
//! which rows reference them, and what they were translated to.
//!
//! Minted identifiers and their dependents live in the `PrimaryKeys` table of
//! a dedicated database shared by every service. A record exists for every
//! minted identifier; its dependency list grows as other rows store the
//! identifier in a foreign-key field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

use offlinekit_common::{DatabaseName, Error, Key, Result, Row};
use offlinekit_storage::{DatabaseSchema, TableSchema, WriteBatch};

use crate::journal::JournalEntry;
use crate::query::Selector;
use crate::store::{Database, LocalStore};

/// Database holding minted identifiers and their dependents.
pub const KEYS_DATABASE: &str = "OfflinePrimaryKeys";

/// Table of [`DependencyRecord`]s.
pub const KEYS_TABLE: &str = "PrimaryKeys";

fn keys_schema() -> DatabaseSchema {
    DatabaseSchema::new(1).with_table(
        KEYS_TABLE,
        TableSchema::new("offlinePrimaryKey").with_indexes([
            "dependencies.serviceName",
            "dependencies.tableName",
            "dependencies.primaryKey",
            "dependencies.foreignKeyName",
        ]),
    )
}

/// A row whose foreign-key field holds an offline identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    /// Service owning the table.
    pub service_name: String,
    pub table_name: String,
    /// Key of the referencing row.
    pub primary_key: Key,
    /// Field holding the offline identifier.
    pub foreign_key_name: String,
}

/// Every known dependent of one offline identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyRecord {
    pub offline_primary_key: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl DependencyRecord {
    pub fn new(offline_primary_key: impl Into<String>) -> Self {
        Self {
            offline_primary_key: offline_primary_key.into(),
            dependencies: Vec::new(),
        }
    }

    /// Add a dependency unless an identical one is recorded. Returns `true`
    /// when added.
    pub fn add(&mut self, dependency: Dependency) -> bool {
        if self.dependencies.contains(&dependency) {
            return false;
        }
        self.dependencies.push(dependency);
        true
    }

    fn to_row(&self) -> Result<Row> {
        match serde_json::to_value(self)? {
            Value::Object(row) => Ok(row),
            other => Err(Error::Serialization(format!(
                "Dependency record encoded as non-object: {}",
                other
            ))),
        }
    }

    fn from_row(row: Row) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(row))?)
    }
}

struct GraphState {
    database: Database,
    records: BTreeMap<String, DependencyRecord>,
}

/// Persistent adjacency from offline identifier to the rows referencing it.
///
/// Records are loaded once and served from memory afterwards; every change
/// is written through before it becomes visible in memory.
pub struct DependencyGraph {
    store: Arc<LocalStore>,
    name: DatabaseName,
    state: Mutex<Option<GraphState>>,
}

impl DependencyGraph {
    /// Graph stored in [`KEYS_DATABASE`].
    pub fn new(store: Arc<LocalStore>) -> Result<Self> {
        Self::with_database(store, DatabaseName::new(KEYS_DATABASE)?)
    }

    /// Graph stored in a custom database.
    pub fn with_database(store: Arc<LocalStore>, name: DatabaseName) -> Result<Self> {
        Ok(Self {
            store,
            name,
            state: Mutex::new(None),
        })
    }

    /// Name of the backing database.
    pub fn database_name(&self) -> &DatabaseName {
        &self.name
    }

    async fn load(&self, state: &mut Option<GraphState>) -> Result<()> {
        if let Some(loaded) = state.as_ref() {
            if !loaded.database.is_stale() {
                return Ok(());
            }
        }

        let database = self.store.open(&self.name, &keys_schema()).await?;
        let mut records = BTreeMap::new();
        for row in database.table(KEYS_TABLE)?.all().await? {
            let record = DependencyRecord::from_row(row)?;
            records.insert(record.offline_primary_key.clone(), record);
        }
        debug!("Loaded {} offline key records", records.len());
        *state = Some(GraphState { database, records });
        Ok(())
    }

    /// Write changed records, then apply them to memory.
    async fn persist(state: &mut GraphState, changed: Vec<DependencyRecord>, removed: Vec<String>) -> Result<()> {
        if changed.is_empty() && removed.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::new([KEYS_TABLE]);
        for record in &changed {
            batch.put(KEYS_TABLE, record.to_row()?);
        }
        for key in &removed {
            batch.delete(KEYS_TABLE, Key::from(key.as_str()));
        }
        state.database.commit(batch).await?;

        for record in changed {
            state.records.insert(record.offline_primary_key.clone(), record);
        }
        for key in removed {
            state.records.remove(&key);
        }
        Ok(())
    }

    /// Record freshly minted offline identifiers.
    pub async fn record_minted(&self, keys: &[String]) -> Result<()> {
        let mut guard = self.state.lock().await;
        self.load(&mut guard).await?;
        let Some(state) = guard.as_mut() else {
            return Err(Error::Storage("Offline key graph failed to load".to_string()));
        };

        let fresh: Vec<DependencyRecord> = keys
            .iter()
            .filter(|k| !state.records.contains_key(k.as_str()))
            .map(DependencyRecord::new)
            .collect();
        debug!("Recording {} minted offline keys", fresh.len());
        Self::persist(state, fresh, Vec::new()).await
    }

    /// Check if `key` was minted offline and not yet translated.
    pub async fn is_minted(&self, key: &str) -> Result<bool> {
        let mut guard = self.state.lock().await;
        self.load(&mut guard).await?;
        Ok(guard
            .as_ref()
            .is_some_and(|state| state.records.contains_key(key)))
    }

    /// Register every foreign-key reference to a minted identifier held by
    /// `rows`.
    ///
    /// Values that are not minted identifiers, and the row's own key field,
    /// are ignored. Returns how many new dependencies were recorded.
    pub async fn register(
        &self,
        service: &str,
        table: &str,
        primary_key_field: &str,
        candidates: &[String],
        rows: &[Row],
    ) -> Result<usize> {
        let mut guard = self.state.lock().await;
        self.load(&mut guard).await?;
        let Some(state) = guard.as_mut() else {
            return Err(Error::Storage("Offline key graph failed to load".to_string()));
        };

        let mut changed: BTreeMap<String, DependencyRecord> = BTreeMap::new();
        let mut added = 0;

        for row in rows {
            let primary_key = Key::from_row(row, primary_key_field)?;
            for field in candidates.iter().filter(|f| f.as_str() != primary_key_field) {
                let Some(Value::String(referenced)) = row.get(field) else {
                    continue;
                };
                if referenced.is_empty() {
                    continue;
                }

                if !changed.contains_key(referenced) {
                    let Some(known) = state.records.get(referenced) else {
                        continue;
                    };
                    changed.insert(referenced.clone(), known.clone());
                }
                let Some(record) = changed.get_mut(referenced) else {
                    continue;
                };

                let dependency = Dependency {
                    service_name: service.to_string(),
                    table_name: table.to_string(),
                    primary_key: primary_key.clone(),
                    foreign_key_name: field.clone(),
                };
                if record.add(dependency) {
                    added += 1;
                }
            }
        }

        let changed: Vec<DependencyRecord> = changed
            .into_values()
            .filter(|r| state.records.get(&r.offline_primary_key) != Some(r))
            .collect();
        Self::persist(state, changed, Vec::new()).await?;
        if added > 0 {
            debug!("Registered {} dependencies from '{}.{}'", added, service, table);
        }
        Ok(added)
    }

    /// The record of one offline identifier.
    pub async fn record(&self, offline: &str) -> Result<Option<DependencyRecord>> {
        let mut guard = self.state.lock().await;
        self.load(&mut guard).await?;
        Ok(guard.as_ref().and_then(|state| state.records.get(offline).cloned()))
    }

    /// Every record, ordered by offline identifier.
    pub async fn records(&self) -> Result<Vec<DependencyRecord>> {
        let mut guard = self.state.lock().await;
        self.load(&mut guard).await?;
        Ok(guard
            .as_ref()
            .map(|state| state.records.values().cloned().collect())
            .unwrap_or_default())
    }

    /// Pass every dependency through `rewrite`: `None` keeps it, `Some(None)`
    /// drops it and `Some(Some(d))` replaces it. Returns how many were touched.
    async fn rewrite_dependents<F>(&self, mut rewrite: F) -> Result<usize>
    where
        F: FnMut(&Dependency) -> Option<Option<Dependency>>,
    {
        let mut guard = self.state.lock().await;
        self.load(&mut guard).await?;
        let Some(state) = guard.as_mut() else {
            return Err(Error::Storage("Offline key graph failed to load".to_string()));
        };

        let mut touched = 0;
        let mut changed = Vec::new();
        for record in state.records.values() {
            let mut next = record.clone();
            next.dependencies.clear();
            let mut dirty = false;
            for dependency in &record.dependencies {
                match rewrite(dependency) {
                    None => {
                        next.add(dependency.clone());
                    }
                    Some(replacement) => {
                        dirty = true;
                        touched += 1;
                        if let Some(replacement) = replacement {
                            next.add(replacement);
                        }
                    }
                }
            }
            if dirty {
                changed.push(next);
            }
        }

        Self::persist(state, changed, Vec::new()).await?;
        Ok(touched)
    }

    /// Drop dependencies whose referencing row is one of `keys` in `table`.
    pub async fn remove_dependents(&self, service: &str, table: &str, keys: &[Key]) -> Result<usize> {
        let keys: HashSet<&Key> = keys.iter().collect();
        let removed = self
            .rewrite_dependents(|d| {
                (d.service_name == service && d.table_name == table && keys.contains(&d.primary_key))
                    .then_some(None)
            })
            .await?;
        if removed > 0 {
            debug!("Removed {} dependencies of deleted '{}' rows", removed, table);
        }
        Ok(removed)
    }

    /// Point dependencies whose referencing row moved from `from` to `to`.
    pub async fn rekey_dependents(&self, service: &str, table: &str, from: &Key, to: &Key) -> Result<usize> {
        self.rewrite_dependents(|d| {
            (d.service_name == service && d.table_name == table && &d.primary_key == from).then(|| {
                Some(Dependency {
                    primary_key: to.clone(),
                    ..d.clone()
                })
            })
        })
        .await
    }

    /// Discard the record of a translated identifier.
    pub async fn forget(&self, offline: &str) -> Result<()> {
        let mut guard = self.state.lock().await;
        self.load(&mut guard).await?;
        let Some(state) = guard.as_mut() else {
            return Err(Error::Storage("Offline key graph failed to load".to_string()));
        };
        if state.records.contains_key(offline) {
            Self::persist(state, Vec::new(), vec![offline.to_string()]).await?;
        }
        Ok(())
    }

    /// Drop the in-memory state; the next call reloads from storage.
    pub async fn reset(&self) {
        *self.state.lock().await = None;
    }
}

/// Process-wide map from offline identifier to server-assigned identifier.
#[derive(Debug, Default)]
pub struct TranslationMap {
    map: RwLock<HashMap<String, Key>>,
}

impl TranslationMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember that `offline` is now known as `online`.
    pub fn insert(&self, offline: impl Into<String>, online: Key) {
        let offline = offline.into();
        info!("Offline key {} is now {}", offline, online);
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(offline, online);
    }

    /// Server identifier for an offline one, if known.
    pub fn get(&self, offline: &str) -> Option<Key> {
        self.map
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(offline)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every translation.
    pub fn clear(&self) {
        self.map
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Substitute a known server identifier; arrays are translated element-wise.
    pub fn translate_value(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => self.get(s).map(|k| k.to_value()).unwrap_or_else(|| value.clone()),
            Value::Array(values) => Value::Array(values.iter().map(|v| self.translate_value(v)).collect()),
            other => other.clone(),
        }
    }

    /// Translate every top-level field of a row.
    pub fn translate_row(&self, row: &Row) -> Row {
        row.iter()
            .map(|(field, value)| (field.clone(), self.translate_value(value)))
            .collect()
    }

    /// Translate a key.
    pub fn translate_key(&self, key: &Key) -> Key {
        match key {
            Key::Text(s) => self.get(s).unwrap_or_else(|| key.clone()),
            _ => key.clone(),
        }
    }

    /// Translate the criteria of an outgoing selector.
    pub fn translate_selector(&self, selector: &Selector) -> Selector {
        Selector {
            criteria: self.translate_row(&selector.criteria),
            ..selector.clone()
        }
    }

    /// Translate a journal entry before it is replayed.
    pub fn translate_entry(&self, entry: &JournalEntry) -> JournalEntry {
        JournalEntry {
            data_id: self.translate_key(&entry.data_id),
            changes: entry.changes.as_ref().map(|row| self.translate_row(row)),
            ..entry.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offlinekit_storage::MemoryEngine;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn graph() -> (Arc<LocalStore>, DependencyGraph) {
        let store = Arc::new(LocalStore::new(Arc::new(MemoryEngine::new())));
        let graph = DependencyGraph::new(store.clone()).unwrap();
        (store, graph)
    }

    #[tokio::test]
    async fn test_register_only_tracks_minted_keys() {
        let (_, graph) = graph();
        graph.record_minted(&["u2".to_string()]).await.unwrap();

        let rows = vec![
            row(json!({"id": "u1", "customerId": "u2", "sellerId": "s9", "note": ""})),
            row(json!({"id": "u3", "customerId": "u2", "sellerId": null})),
        ];
        let candidates: Vec<String> = ["id", "customerId", "sellerId", "note"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let added = graph
            .register("orders", "Order", "id", &candidates, &rows)
            .await
            .unwrap();
        assert_eq!(added, 2);

        // Registering again is deduplicated.
        let added = graph
            .register("orders", "Order", "id", &candidates, &rows)
            .await
            .unwrap();
        assert_eq!(added, 0);

        let record = graph.record("u2").await.unwrap().unwrap();
        assert_eq!(record.dependencies.len(), 2);
        assert_eq!(record.dependencies[0].primary_key, Key::from("u1"));
        assert_eq!(record.dependencies[0].foreign_key_name, "customerId");
        assert!(graph.record("s9").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_records_survive_reload() {
        let (store, graph) = graph();
        graph.record_minted(&["u2".to_string()]).await.unwrap();
        graph
            .register(
                "orders",
                "Order",
                "id",
                &["customerId".to_string()],
                &[row(json!({"id": "u1", "customerId": "u2"}))],
            )
            .await
            .unwrap();

        let reloaded = DependencyGraph::new(store).unwrap();
        let records = reloaded.records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].dependencies.len(), 1);
        assert!(reloaded.is_minted("u2").await.unwrap());
    }

    #[tokio::test]
    async fn test_rekey_remove_and_forget() {
        let (_, graph) = graph();
        graph
            .record_minted(&["u1".to_string(), "u2".to_string()])
            .await
            .unwrap();
        let fields = ["customerId".to_string()];
        graph
            .register("orders", "Order", "id", &fields, &[row(json!({"id": "u1", "customerId": "u2"}))])
            .await
            .unwrap();
        graph
            .register("orders", "Order", "id", &fields, &[row(json!({"id": 7, "customerId": "u2"}))])
            .await
            .unwrap();

        let moved = graph
            .rekey_dependents("orders", "Order", &Key::from("u1"), &Key::from("o1"))
            .await
            .unwrap();
        assert_eq!(moved, 1);
        let record = graph.record("u2").await.unwrap().unwrap();
        assert_eq!(record.dependencies[0].primary_key, Key::from("o1"));

        let removed = graph
            .remove_dependents("orders", "Order", &[Key::from(7i64)])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(graph.record("u2").await.unwrap().unwrap().dependencies.len(), 1);

        graph.forget("u2").await.unwrap();
        assert!(graph.record("u2").await.unwrap().is_none());
        assert!(!graph.is_minted("u2").await.unwrap());
        assert!(graph.is_minted("u1").await.unwrap());
    }

    #[test]
    fn test_translation_map() {
        let map = TranslationMap::new();
        assert!(map.is_empty());
        map.insert("u2", Key::from("c42"));
        map.insert("u3", Key::from(17i64));

        assert_eq!(map.translate_value(&json!("u2")), json!("c42"));
        assert_eq!(map.translate_value(&json!(["u3", "x", 1])), json!([17, "x", 1]));
        assert_eq!(
            map.translate_row(&row(json!({"customerId": "u2", "n": 1}))),
            row(json!({"customerId": "c42", "n": 1}))
        );

        let selector = Selector::new("Order").with("customerId", "u2").any_of("id", ["u3", "a"]);
        let translated = map.translate_selector(&selector);
        assert_eq!(translated.criteria["customerId"], json!("c42"));
        assert_eq!(translated.criteria["id"], json!([17, "a"]));
        assert_eq!(translated.table, "Order");

        let entry = JournalEntry::mutation(
            "Order",
            crate::journal::Operation::Update,
            Key::from("u3"),
            row(json!({"id": "u3", "customerId": "u2"})),
            None,
            1,
        );
        let entry = map.translate_entry(&entry);
        assert_eq!(entry.data_id, Key::from(17i64));
        assert_eq!(entry.changes.unwrap()["customerId"], json!("c42"));

        map.clear();
        assert!(map.get("u2").is_none());
    }
}
