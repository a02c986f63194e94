//! Operation Journal: pending offline mutations and fetch markers.
//!
//! The journal is an auto-increment table living next to the data tables of
//! every service database. Entries come in two kinds:
//! - fetch markers (`lastFetched` set, no `operation`) recording when a row
//!   of a type was last received from the backend
//! - mutations (`operation` set) awaiting replay, read back in insertion order

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

use offlinekit_common::{Error, Key, Result, Row};
use offlinekit_storage::{TableSchema, WriteBatch};

use crate::store::Database;

/// Name of the journal table in every service database.
pub const JOURNAL_TABLE: &str = "Operation";

/// Physical layout of the journal table.
pub fn journal_schema() -> TableSchema {
    TableSchema::auto_increment("id").with_indexes([
        "dataID",
        "type",
        "lastFetched",
        "lastModified",
        "operation",
        "changes",
        "context",
    ])
}

/// Kind of a recorded mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    /// Row created offline.
    Create,
    /// Row updated offline.
    Update,
    /// Row deleted offline.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        write!(f, "{}", name)
    }
}

/// One journal row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalEntry {
    /// Assigned by the journal table on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// Primary key of the data row this entry is about.
    #[serde(rename = "dataID")]
    pub data_id: Key,
    /// Data table name.
    #[serde(rename = "type")]
    pub table: String,
    /// Milliseconds since the epoch when the row was last fetched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fetched: Option<i64>,
    /// Milliseconds since the epoch when the row was last mutated offline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    /// Full row snapshot at mutation time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<Row>,
    /// Opaque caller payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl JournalEntry {
    /// Marker recording that `data_id` of `table` was fetched at `fetched_at`.
    pub fn fetch_marker(table: impl Into<String>, data_id: Key, fetched_at: i64) -> Self {
        Self {
            id: None,
            data_id,
            table: table.into(),
            last_fetched: Some(fetched_at),
            last_modified: None,
            operation: None,
            changes: None,
            context: None,
        }
    }

    /// Pending mutation of one row.
    pub fn mutation(
        table: impl Into<String>,
        operation: Operation,
        data_id: Key,
        changes: Row,
        context: Option<Value>,
        modified_at: i64,
    ) -> Self {
        Self {
            id: None,
            data_id,
            table: table.into(),
            last_fetched: None,
            last_modified: Some(modified_at),
            operation: Some(operation),
            changes: Some(changes),
            context,
        }
    }

    /// Check if this entry is a fetch marker.
    pub fn is_fetch_marker(&self) -> bool {
        self.last_fetched.is_some() && self.operation.is_none()
    }

    /// Check if this entry is awaiting replay.
    pub fn is_pending(&self) -> bool {
        self.operation.is_some()
    }

    /// Journal primary key, once stored.
    pub fn key(&self) -> Result<Key> {
        self.id.map(Key::from).ok_or_else(|| {
            Error::InvalidInput("Journal entry has not been stored yet".to_string())
        })
    }

    /// Encode as a journal row.
    pub fn to_row(&self) -> Result<Row> {
        match serde_json::to_value(self)? {
            Value::Object(row) => Ok(row),
            other => Err(Error::Serialization(format!(
                "Journal entry encoded as non-object: {}",
                other
            ))),
        }
    }

    /// Decode a journal row.
    pub fn from_row(row: Row) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(row))?)
    }
}

/// Current time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Operation Journal of one service database.
#[derive(Debug, Clone)]
pub struct OperationJournal {
    database: Database,
}

impl OperationJournal {
    /// Journal of an open database.
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Every entry in insertion order.
    pub async fn entries(&self) -> Result<Vec<JournalEntry>> {
        self.database
            .table(JOURNAL_TABLE)?
            .all()
            .await?
            .into_iter()
            .map(JournalEntry::from_row)
            .collect()
    }

    /// Fetch markers, optionally restricted to one table.
    pub async fn fetch_markers(&self, table: Option<&str>) -> Result<Vec<JournalEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.is_fetch_marker() && table.map_or(true, |t| e.table == t))
            .collect())
    }

    /// Pending mutations in insertion order, the order they must be replayed in.
    pub async fn read_pending(&self) -> Result<Vec<JournalEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(JournalEntry::is_pending)
            .collect())
    }

    /// Entries of `table` about any of `keys`.
    pub async fn entries_for(&self, table: &str, keys: &HashSet<Key>) -> Result<Vec<JournalEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .filter(|e| e.table == table && keys.contains(&e.data_id))
            .collect())
    }

    /// Delete every fetch marker of `table`. Returns how many were removed.
    pub async fn clear_fetch_markers(&self, table: &str) -> Result<usize> {
        let markers = self.fetch_markers(Some(table)).await?;
        let mut batch = WriteBatch::new([JOURNAL_TABLE]);
        Self::stage_removal(&mut batch, &markers)?;
        self.database.commit(batch).await?;
        debug!("Cleared {} fetch markers of '{}'", markers.len(), table);
        Ok(markers.len())
    }

    /// Append one mutation on its own, outside a data write.
    pub async fn record_mutation(
        &self,
        table: &str,
        operation: Operation,
        row: &Row,
        context: Option<Value>,
    ) -> Result<u64> {
        let key = self.database.table(table)?.key_of(row)?;
        let mut batch = WriteBatch::new([JOURNAL_TABLE]);
        Self::stage_mutation(&mut batch, table, operation, key, row.clone(), context, now_millis())?;
        let receipt = self.database.commit(batch).await?;
        match receipt.keys.first() {
            Some(Key::Integer(id)) => u64::try_from(*id)
                .map_err(|_| Error::Storage(format!("Journal id {} out of range", id))),
            _ => Err(Error::Storage("Journal did not assign an id".to_string())),
        }
    }

    /// Remove the given entries once they have been replayed.
    pub async fn clear(&self, entries: &[JournalEntry]) -> Result<()> {
        let mut batch = WriteBatch::new([JOURNAL_TABLE]);
        Self::stage_removal(&mut batch, entries)?;
        self.database.commit(batch).await?;
        debug!("Cleared {} journal entries", entries.len());
        Ok(())
    }

    /// Queue a mutation entry into a batch scoped to the journal.
    pub fn stage_mutation(
        batch: &mut WriteBatch,
        table: &str,
        operation: Operation,
        key: Key,
        row: Row,
        context: Option<Value>,
        modified_at: i64,
    ) -> Result<()> {
        let entry = JournalEntry::mutation(table, operation, key, row, context, modified_at);
        batch.add(JOURNAL_TABLE, entry.to_row()?);
        Ok(())
    }

    /// Queue one fresh fetch marker per key.
    pub fn stage_fetch_markers(
        batch: &mut WriteBatch,
        table: &str,
        keys: &[Key],
        fetched_at: i64,
    ) -> Result<()> {
        for key in keys {
            let marker = JournalEntry::fetch_marker(table, key.clone(), fetched_at);
            batch.add(JOURNAL_TABLE, marker.to_row()?);
        }
        Ok(())
    }

    /// Queue the removal of stored entries.
    pub fn stage_removal(batch: &mut WriteBatch, entries: &[JournalEntry]) -> Result<()> {
        for entry in entries {
            batch.delete(JOURNAL_TABLE, entry.key()?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;
    use offlinekit_common::DatabaseName;
    use offlinekit_storage::{DatabaseSchema, MemoryEngine};
    use serde_json::json;
    use std::sync::Arc;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    async fn journal() -> OperationJournal {
        let store = LocalStore::new(Arc::new(MemoryEngine::new()));
        let schema = DatabaseSchema::new(1)
            .with_table("Foo", TableSchema::new("id"))
            .with_table(JOURNAL_TABLE, journal_schema());
        let database = store
            .open(&DatabaseName::new("svc").unwrap(), &schema)
            .await
            .unwrap();
        OperationJournal::new(database)
    }

    #[test]
    fn test_journal_definition() {
        assert_eq!(
            journal_schema().to_string(),
            "++id,dataID,type,lastFetched,lastModified,operation,changes,context"
        );
    }

    #[test]
    fn test_entry_row_shape() {
        let entry = JournalEntry::mutation(
            "Foo",
            Operation::Create,
            Key::from("u1"),
            row(json!({"id": "u1"})),
            Some(json!({"by": "test"})),
            10,
        );
        let encoded = entry.to_row().unwrap();
        assert_eq!(
            Value::Object(encoded.clone()),
            json!({
                "dataID": "u1",
                "type": "Foo",
                "lastModified": 10,
                "operation": "create",
                "changes": {"id": "u1"},
                "context": {"by": "test"}
            })
        );
        assert_eq!(JournalEntry::from_row(encoded).unwrap(), entry);

        let marker = JournalEntry::fetch_marker("Foo", Key::from(3i64), 20);
        assert!(marker.is_fetch_marker());
        assert!(!marker.is_pending());
    }

    #[tokio::test]
    async fn test_pending_in_insertion_order() {
        let journal = journal().await;
        journal
            .record_mutation("Foo", Operation::Create, &row(json!({"id": 2})), None)
            .await
            .unwrap();
        journal
            .record_mutation("Foo", Operation::Update, &row(json!({"id": 1})), None)
            .await
            .unwrap();
        journal
            .record_mutation("Foo", Operation::Delete, &row(json!({"id": 2})), None)
            .await
            .unwrap();

        let pending = journal.read_pending().await.unwrap();
        let ops: Vec<Operation> = pending.iter().filter_map(|e| e.operation).collect();
        assert_eq!(ops, vec![Operation::Create, Operation::Update, Operation::Delete]);
        assert_eq!(pending[0].id, Some(1));
        assert_eq!(pending[0].data_id, Key::from(2i64));

        journal.clear(&pending[..2]).await.unwrap();
        let rest = journal.read_pending().await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].operation, Some(Operation::Delete));
    }

    #[tokio::test]
    async fn test_clear_fetch_markers_by_type() {
        let journal = journal().await;
        let mut batch = WriteBatch::new([JOURNAL_TABLE]);
        OperationJournal::stage_fetch_markers(&mut batch, "Foo", &[Key::from(1i64), Key::from(2i64)], 5).unwrap();
        OperationJournal::stage_fetch_markers(&mut batch, "Bar", &[Key::from(1i64)], 5).unwrap();
        journal.database.commit(batch).await.unwrap();
        journal
            .record_mutation("Foo", Operation::Update, &row(json!({"id": 1})), None)
            .await
            .unwrap();

        assert_eq!(journal.fetch_markers(None).await.unwrap().len(), 3);
        assert_eq!(journal.clear_fetch_markers("Foo").await.unwrap(), 2);

        let markers = journal.fetch_markers(None).await.unwrap();
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].table, "Bar");
        assert_eq!(journal.read_pending().await.unwrap().len(), 1);
    }
}
