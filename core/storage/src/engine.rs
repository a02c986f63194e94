//! Storage engine trait definition.

use async_trait::async_trait;
use std::collections::BTreeSet;

use offlinekit_common::types::is_blank;
use offlinekit_common::{Error, Key, Result, Row};

use crate::schema::{DatabaseSchema, TableSchema};

/// A single mutation inside a [`WriteBatch`].
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Insert a row; fails if its key is already present.
    Add { table: String, row: Row },
    /// Insert or replace a row.
    Put { table: String, row: Row },
    /// Merge fields into an existing row; no-op when the row is absent.
    Update {
        table: String,
        key: Key,
        changes: Row,
    },
    /// Remove a row; no-op when the row is absent.
    Delete { table: String, key: Key },
}

impl WriteOp {
    /// Table this operation touches.
    pub fn table(&self) -> &str {
        match self {
            WriteOp::Add { table, .. }
            | WriteOp::Put { table, .. }
            | WriteOp::Update { table, .. }
            | WriteOp::Delete { table, .. } => table,
        }
    }
}

/// An all-or-nothing group of mutations over a declared set of tables.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    scope: BTreeSet<String>,
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Create a batch allowed to touch exactly the given tables.
    pub fn new<I, S>(scope: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            scope: scope.into_iter().map(Into::into).collect(),
            ops: Vec::new(),
        }
    }

    /// Queue an insert.
    pub fn add(&mut self, table: &str, row: Row) -> &mut Self {
        self.ops.push(WriteOp::Add {
            table: table.to_string(),
            row,
        });
        self
    }

    /// Queue an upsert.
    pub fn put(&mut self, table: &str, row: Row) -> &mut Self {
        self.ops.push(WriteOp::Put {
            table: table.to_string(),
            row,
        });
        self
    }

    /// Queue a field merge into an existing row.
    pub fn update(&mut self, table: &str, key: Key, changes: Row) -> &mut Self {
        self.ops.push(WriteOp::Update {
            table: table.to_string(),
            key,
            changes,
        });
        self
    }

    /// Queue a removal.
    pub fn delete(&mut self, table: &str, key: Key) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            table: table.to_string(),
            key,
        });
        self
    }

    /// Tables this batch may touch.
    pub fn scope(&self) -> &BTreeSet<String> {
        &self.scope
    }

    /// Queued operations in order.
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consume the batch, yielding its operations.
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    /// Number of queued operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Check the scope against a database schema.
    ///
    /// # Errors
    /// - A scoped table does not exist
    /// - An operation touches a table outside the scope
    pub fn validate(&self, database: &str, schema: &DatabaseSchema) -> Result<()> {
        for table in &self.scope {
            if !schema.has_table(table) {
                return Err(Error::Transaction(format!(
                    "Table '{}' does not exist in database '{}'",
                    table, database
                )));
            }
        }
        for op in &self.ops {
            if !self.scope.contains(op.table()) {
                return Err(Error::Transaction(format!(
                    "Table '{}' is outside the transaction scope",
                    op.table()
                )));
            }
        }
        Ok(())
    }
}

/// Outcome of a committed batch.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    /// Key of every add/put, in operation order.
    pub keys: Vec<Key>,
}

/// Storage engine trait for different physical backends.
///
/// An engine holds any number of named databases, each a versioned set of
/// tables, plus a small flag store that lives outside every database.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Get the engine name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Check if a database exists.
    async fn exists(&self, database: &str) -> Result<bool>;

    /// Names of every physically present database.
    async fn databases(&self) -> Result<Vec<String>>;

    /// Physical schema of a database, `None` when it does not exist.
    async fn schema(&self, database: &str) -> Result<Option<DatabaseSchema>>;

    /// Create a database, or upgrade an existing one in place.
    ///
    /// # Preconditions
    /// - For an existing database, `schema.version` is greater than the current one
    ///
    /// # Postconditions
    /// - Missing tables are created, index lists replaced
    /// - Tables absent from `schema` are kept
    ///
    /// # Errors
    /// - Version does not increase
    /// - An existing table's primary key would change
    async fn apply_schema(&self, database: &str, schema: &DatabaseSchema) -> Result<()>;

    /// Delete a database. Deleting a missing database is not an error.
    async fn delete(&self, database: &str) -> Result<()>;

    /// Read every row of a table in primary key order.
    ///
    /// # Errors
    /// - Database or table missing
    async fn scan(&self, database: &str, table: &str) -> Result<Vec<Row>>;

    /// Read one row by primary key.
    async fn get(&self, database: &str, table: &str, key: &Key) -> Result<Option<Row>>;

    /// Apply a batch atomically.
    ///
    /// # Postconditions
    /// - Either every operation is visible or none is
    ///
    /// # Errors
    /// - Scope violation, missing table, duplicate key on add
    async fn commit(&self, database: &str, batch: WriteBatch) -> Result<CommitReceipt>;

    /// Read a flag stored outside every database.
    async fn read_flag(&self, key: &str) -> Result<Option<String>>;

    /// Write a flag stored outside every database.
    async fn write_flag(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a flag.
    async fn remove_flag(&self, key: &str) -> Result<()>;
}

/// Resolve the key of a row about to be written, assigning one for
/// auto-increment tables. `next_id` is the table's next free integer key.
pub(crate) fn assign_key(table: &TableSchema, mut row: Row, next_id: &mut u64) -> Result<(Key, Row)> {
    if table.auto_increment && is_blank(row.get(&table.primary_key)) {
        let id = *next_id;
        row.insert(table.primary_key.clone(), serde_json::Value::from(id));
        *next_id += 1;
        return Ok((Key::from(id), row));
    }

    let key = Key::from_row(&row, &table.primary_key)
        .map_err(|e| Error::Transaction(e.to_string()))?;

    if table.auto_increment {
        match &key {
            Key::Integer(n) if *n >= i128::from(*next_id) => {
                *next_id = u64::try_from(n + 1).unwrap_or(u64::MAX);
            }
            Key::Float(n) if *n >= *next_id as f64 => {
                *next_id = n.floor() as u64 + 1;
            }
            _ => {}
        }
    }

    Ok((key, row))
}

/// Merge `changes` into `row`, refusing to move the row to another key.
pub(crate) fn merge_changes(table: &TableSchema, key: &Key, mut row: Row, changes: Row) -> Result<Row> {
    if let Some(value) = changes.get(&table.primary_key) {
        if Key::from_value(value).ok().as_ref() != Some(key) {
            return Err(Error::Transaction(format!(
                "Update cannot change primary key '{}' of {}",
                table.primary_key, key
            )));
        }
    }
    for (field, value) in changes {
        row.insert(field, value);
    }
    Ok(row)
}

/// Compute the schema resulting from an in-place upgrade.
pub(crate) fn upgraded_schema(
    database: &str,
    current: &DatabaseSchema,
    next: &DatabaseSchema,
) -> Result<DatabaseSchema> {
    if next.version <= current.version {
        return Err(Error::Storage(format!(
            "Database '{}' is at version {}; cannot apply version {}",
            database, current.version, next.version
        )));
    }

    let mut merged = current.clone();
    merged.version = next.version;
    for (name, table) in &next.tables {
        if let Some(existing) = current.tables.get(name) {
            if !existing.same_key(table) {
                return Err(Error::Storage(format!(
                    "Cannot change primary key of table '{}' in '{}' from '{}' to '{}' in place",
                    name, database, existing, table
                )));
            }
        }
        merged.tables.insert(name.clone(), table.clone());
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_batch_scope_validation() {
        let schema = DatabaseSchema::new(1)
            .with_table("Foo", TableSchema::new("id"))
            .with_table("Operation", TableSchema::auto_increment("id"));

        let mut batch = WriteBatch::new(["Foo"]);
        batch.put("Foo", row(json!({"id": 1})));
        assert!(batch.validate("db", &schema).is_ok());

        batch.put("Operation", row(json!({"dataID": 1})));
        assert!(matches!(batch.validate("db", &schema), Err(Error::Transaction(_))));

        let missing = WriteBatch::new(["Bar"]);
        assert!(missing.validate("db", &schema).is_err());
    }

    #[test]
    fn test_assign_key_auto_increment() {
        let table = TableSchema::auto_increment("id");
        let mut next = 1;
        let (key, stored) = assign_key(&table, row(json!({"x": 1})), &mut next).unwrap();
        assert_eq!(key, Key::from(1u64));
        assert_eq!(stored.get("id"), Some(&json!(1)));
        assert_eq!(next, 2);

        let (key, _) = assign_key(&table, row(json!({"id": 10})), &mut next).unwrap();
        assert_eq!(key, Key::from(10u64));
        assert_eq!(next, 11);
    }

    #[test]
    fn test_assign_key_requires_key() {
        let table = TableSchema::new("id");
        let mut next = 1;
        assert!(assign_key(&table, row(json!({"x": 1})), &mut next).is_err());
    }

    #[test]
    fn test_merge_changes() {
        let table = TableSchema::new("id");
        let key = Key::from("a");
        let merged = merge_changes(
            &table,
            &key,
            row(json!({"id": "a", "n": 1, "keep": true})),
            row(json!({"id": "a", "n": 2})),
        )
        .unwrap();
        assert_eq!(merged, row(json!({"id": "a", "n": 2, "keep": true})));

        let moved = merge_changes(&table, &key, row(json!({"id": "a"})), row(json!({"id": "b"})));
        assert!(moved.is_err());
    }

    #[test]
    fn test_upgraded_schema() {
        let current = DatabaseSchema::new(1)
            .with_table("Foo", TableSchema::new("id"))
            .with_table("Legacy", TableSchema::new("key"));
        let next = DatabaseSchema::new(2)
            .with_table("Foo", TableSchema::new("id").with_indexes(["name"]))
            .with_table("Bar", TableSchema::new("id"));

        let merged = upgraded_schema("db", &current, &next).unwrap();
        assert_eq!(merged.version, 2);
        assert!(merged.has_table("Legacy"));
        assert!(merged.has_table("Bar"));
        assert_eq!(merged.table("Foo").unwrap().indexes, vec!["name"]);

        let same_version = DatabaseSchema::new(1);
        assert!(upgraded_schema("db", &current, &same_version).is_err());

        let rekeyed = DatabaseSchema::new(3).with_table("Foo", TableSchema::new("uuid"));
        assert!(upgraded_schema("db", &current, &rekeyed).is_err());
    }
}
