//! In-memory storage engine for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use offlinekit_common::{Error, Key, Result, Row};

use crate::engine::{assign_key, merge_changes, upgraded_schema, CommitReceipt, StorageEngine, WriteBatch, WriteOp};
use crate::schema::{DatabaseSchema, TableSchema};

/// In-memory table.
#[derive(Debug, Clone)]
struct MemTable {
    schema: TableSchema,
    rows: BTreeMap<Key, Row>,
    next_id: u64,
}

impl MemTable {
    fn new(schema: TableSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }
}

/// In-memory database.
#[derive(Debug, Clone)]
struct MemDatabase {
    schema: DatabaseSchema,
    tables: HashMap<String, MemTable>,
}

impl MemDatabase {
    fn new(schema: &DatabaseSchema) -> Self {
        let tables = schema
            .tables
            .iter()
            .map(|(name, table)| (name.clone(), MemTable::new(table.clone())))
            .collect();
        Self {
            schema: schema.clone(),
            tables,
        }
    }

    fn table(&self, database: &str, table: &str) -> Result<&MemTable> {
        self.tables.get(table).ok_or_else(|| {
            Error::DatabaseMissing(format!("Table '{}' not found in '{}'", table, database))
        })
    }
}

/// In-memory storage engine.
///
/// Useful for testing and ephemeral sessions. All data is stored in memory
/// and lost on drop.
pub struct MemoryEngine {
    databases: Arc<RwLock<HashMap<String, MemDatabase>>>,
    flags: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryEngine {
    /// Create a new empty memory engine.
    pub fn new() -> Self {
        Self {
            databases: Arc::new(RwLock::new(HashMap::new())),
            flags: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Storage("Memory engine lock poisoned".to_string())
}

fn missing(database: &str) -> Error {
    Error::DatabaseMissing(format!("Database '{}' does not exist", database))
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    fn name(&self) -> &str {
        "memory"
    }

    async fn exists(&self, database: &str) -> Result<bool> {
        Ok(self.databases.read().map_err(poisoned)?.contains_key(database))
    }

    async fn databases(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.databases.read().map_err(poisoned)?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn schema(&self, database: &str) -> Result<Option<DatabaseSchema>> {
        let databases = self.databases.read().map_err(poisoned)?;
        Ok(databases.get(database).map(|db| db.schema.clone()))
    }

    async fn apply_schema(&self, database: &str, schema: &DatabaseSchema) -> Result<()> {
        let mut databases = self.databases.write().map_err(poisoned)?;

        let Some(db) = databases.get_mut(database) else {
            debug!("Creating memory database '{}' at version {}", database, schema.version);
            databases.insert(database.to_string(), MemDatabase::new(schema));
            return Ok(());
        };

        let merged = upgraded_schema(database, &db.schema, schema)?;
        for (name, table) in &merged.tables {
            match db.tables.get_mut(name) {
                Some(existing) => existing.schema = table.clone(),
                None => {
                    db.tables.insert(name.clone(), MemTable::new(table.clone()));
                }
            }
        }
        debug!("Upgraded memory database '{}' to version {}", database, merged.version);
        db.schema = merged;
        Ok(())
    }

    async fn delete(&self, database: &str) -> Result<()> {
        self.databases.write().map_err(poisoned)?.remove(database);
        Ok(())
    }

    async fn scan(&self, database: &str, table: &str) -> Result<Vec<Row>> {
        let databases = self.databases.read().map_err(poisoned)?;
        let db = databases.get(database).ok_or_else(|| missing(database))?;
        Ok(db.table(database, table)?.rows.values().cloned().collect())
    }

    async fn get(&self, database: &str, table: &str, key: &Key) -> Result<Option<Row>> {
        let databases = self.databases.read().map_err(poisoned)?;
        let db = databases.get(database).ok_or_else(|| missing(database))?;
        Ok(db.table(database, table)?.rows.get(key).cloned())
    }

    async fn commit(&self, database: &str, batch: WriteBatch) -> Result<CommitReceipt> {
        let mut databases = self.databases.write().map_err(poisoned)?;
        let db = databases.get_mut(database).ok_or_else(|| missing(database))?;
        batch.validate(database, &db.schema)?;

        // Work on copies of the scoped tables; swap them in only on success.
        let mut staged: HashMap<String, MemTable> = batch
            .scope()
            .iter()
            .filter_map(|name| db.tables.get(name).map(|t| (name.clone(), t.clone())))
            .collect();
        let mut receipt = CommitReceipt::default();

        for op in batch.into_ops() {
            let table = staged.get_mut(op.table()).ok_or_else(|| {
                Error::Transaction(format!("Table '{}' is not staged", op.table()))
            })?;

            match op {
                WriteOp::Add { row, .. } => {
                    let (key, row) = assign_key(&table.schema, row, &mut table.next_id)?;
                    if table.rows.contains_key(&key) {
                        return Err(Error::Transaction(format!(
                            "Key {} already exists in '{}'",
                            key, database
                        )));
                    }
                    table.rows.insert(key.clone(), row);
                    receipt.keys.push(key);
                }
                WriteOp::Put { row, .. } => {
                    let (key, row) = assign_key(&table.schema, row, &mut table.next_id)?;
                    table.rows.insert(key.clone(), row);
                    receipt.keys.push(key);
                }
                WriteOp::Update { key, changes, .. } => {
                    if let Some(existing) = table.rows.remove(&key) {
                        let merged = merge_changes(&table.schema, &key, existing, changes)?;
                        table.rows.insert(key, merged);
                    }
                }
                WriteOp::Delete { key, .. } => {
                    table.rows.remove(&key);
                }
            }
        }

        for (name, table) in staged {
            db.tables.insert(name, table);
        }
        Ok(receipt)
    }

    async fn read_flag(&self, key: &str) -> Result<Option<String>> {
        Ok(self.flags.read().map_err(poisoned)?.get(key).cloned())
    }

    async fn write_flag(&self, key: &str, value: &str) -> Result<()> {
        self.flags
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_flag(&self, key: &str) -> Result<()> {
        self.flags.write().map_err(poisoned)?.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn schema() -> DatabaseSchema {
        DatabaseSchema::new(1)
            .with_table("Foo", TableSchema::new("id").with_indexes(["name"]))
            .with_table("Operation", TableSchema::auto_increment("id"))
    }

    #[tokio::test]
    async fn test_create_and_scan() {
        let engine = MemoryEngine::new();
        assert!(!engine.exists("db").await.unwrap());
        engine.apply_schema("db", &schema()).await.unwrap();
        assert!(engine.exists("db").await.unwrap());

        let mut batch = WriteBatch::new(["Foo"]);
        batch.put("Foo", row(json!({"id": 2, "name": "b"})));
        batch.put("Foo", row(json!({"id": 1, "name": "a"})));
        engine.commit("db", batch).await.unwrap();

        let rows = engine.scan("db", "Foo").await.unwrap();
        assert_eq!(rows, vec![row(json!({"id": 1, "name": "a"})), row(json!({"id": 2, "name": "b"}))]);

        let one = engine.get("db", "Foo", &Key::from(2i64)).await.unwrap();
        assert_eq!(one, Some(row(json!({"id": 2, "name": "b"}))));
    }

    #[tokio::test]
    async fn test_commit_is_atomic() {
        let engine = MemoryEngine::new();
        engine.apply_schema("db", &schema()).await.unwrap();

        let mut first = WriteBatch::new(["Foo"]);
        first.add("Foo", row(json!({"id": 1})));
        engine.commit("db", first).await.unwrap();

        let mut second = WriteBatch::new(["Foo", "Operation"]);
        second.add("Operation", row(json!({"dataID": 2})));
        second.add("Foo", row(json!({"id": 2})));
        second.add("Foo", row(json!({"id": 1})));
        let result = engine.commit("db", second).await;
        assert!(matches!(result, Err(Error::Transaction(_))));

        assert_eq!(engine.scan("db", "Foo").await.unwrap().len(), 1);
        assert!(engine.scan("db", "Operation").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_auto_increment_receipt() {
        let engine = MemoryEngine::new();
        engine.apply_schema("db", &schema()).await.unwrap();

        let mut batch = WriteBatch::new(["Operation"]);
        batch.add("Operation", row(json!({"dataID": "a"})));
        batch.add("Operation", row(json!({"dataID": "b"})));
        let receipt = engine.commit("db", batch).await.unwrap();
        assert_eq!(receipt.keys, vec![Key::from(1u64), Key::from(2u64)]);

        let rows = engine.scan("db", "Operation").await.unwrap();
        assert_eq!(rows[1], row(json!({"dataID": "b", "id": 2})));
    }

    #[tokio::test]
    async fn test_update_merges_and_ignores_missing() {
        let engine = MemoryEngine::new();
        engine.apply_schema("db", &schema()).await.unwrap();

        let mut batch = WriteBatch::new(["Foo"]);
        batch.put("Foo", row(json!({"id": 1, "name": "a", "n": 1})));
        engine.commit("db", batch).await.unwrap();

        let mut batch = WriteBatch::new(["Foo"]);
        batch.update("Foo", Key::from(1i64), row(json!({"n": 2})));
        batch.update("Foo", Key::from(9i64), row(json!({"n": 3})));
        engine.commit("db", batch).await.unwrap();

        let rows = engine.scan("db", "Foo").await.unwrap();
        assert_eq!(rows, vec![row(json!({"id": 1, "name": "a", "n": 2}))]);
    }

    #[tokio::test]
    async fn test_upgrade_keeps_rows() {
        let engine = MemoryEngine::new();
        engine.apply_schema("db", &schema()).await.unwrap();

        let mut batch = WriteBatch::new(["Foo"]);
        batch.put("Foo", row(json!({"id": 1})));
        engine.commit("db", batch).await.unwrap();

        let next = DatabaseSchema::new(2).with_table("Bar", TableSchema::new("id"));
        engine.apply_schema("db", &next).await.unwrap();

        let current = engine.schema("db").await.unwrap().unwrap();
        assert_eq!(current.version, 2);
        assert!(current.has_table("Foo"));
        assert!(current.has_table("Bar"));
        assert_eq!(engine.scan("db", "Foo").await.unwrap().len(), 1);

        let rekeyed = DatabaseSchema::new(3).with_table("Foo", TableSchema::new("uuid"));
        assert!(engine.apply_schema("db", &rekeyed).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_database() {
        let engine = MemoryEngine::new();
        let result = engine.scan("nope", "Foo").await;
        assert!(matches!(result, Err(Error::DatabaseMissing(_))));
    }

    #[tokio::test]
    async fn test_flags() {
        let engine = MemoryEngine::new();
        assert!(engine.read_flag("a").await.unwrap().is_none());
        engine.write_flag("a", "1").await.unwrap();
        assert_eq!(engine.read_flag("a").await.unwrap().as_deref(), Some("1"));
        engine.remove_flag("a").await.unwrap();
        assert!(engine.read_flag("a").await.unwrap().is_none());
    }
}
