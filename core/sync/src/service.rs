//! Sync Coordinator for one domain service.
//!
//! An [`OfflineService`] owns one database converged onto its logical schema.
//! Every write goes through here so that data rows and journal entries change
//! in one transaction, and so that multi-step writes on the service never
//! interleave.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, PoisonError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use offlinekit_common::types::is_blank;
use offlinekit_common::{DatabaseName, Key, Result, Row};
use offlinekit_storage::WriteBatch;
use serde_json::Value;

use crate::journal::{now_millis, JournalEntry, Operation, OperationJournal, JOURNAL_TABLE};
use crate::migration::{LogicalSchema, MigrationReport, SchemaManager};
use crate::query::{self, ResultSink, Selector};
use crate::reconcile::{DependencyGraph, TranslationMap};
use crate::store::{Database, LocalStore, Table};

/// Outcome of [`OfflineService::write_authoritative`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthoritativeWrite {
    /// Rows upserted from the backend.
    pub upserted: usize,
    /// Cached rows pruned because the backend no longer has them.
    pub pruned: Vec<Key>,
    /// Journal entries removed (stale fetch markers and entries of pruned rows).
    pub journal_removed: usize,
}

/// Offline persistence for one domain service.
pub struct OfflineService {
    name: String,
    database_name: DatabaseName,
    schema: LogicalSchema,
    store: Arc<LocalStore>,
    manager: SchemaManager,
    graph: Arc<DependencyGraph>,
    translations: Arc<TranslationMap>,
    init: Mutex<Option<(Database, MigrationReport)>>,
    writer: Mutex<()>,
    foreign_keys: std::sync::Mutex<HashMap<String, Vec<String>>>,
}

impl OfflineService {
    /// Create a service whose database carries the service name.
    ///
    /// Nothing touches storage until the first operation or [`OfflineService::initialize`].
    pub fn new(
        name: impl Into<String>,
        schema: LogicalSchema,
        store: Arc<LocalStore>,
        graph: Arc<DependencyGraph>,
        translations: Arc<TranslationMap>,
    ) -> Result<Self> {
        let name = name.into();
        let database_name = DatabaseName::new(name.clone())?;
        Ok(Self {
            name,
            database_name,
            schema,
            manager: SchemaManager::new(store.clone()),
            store,
            graph,
            translations,
            init: Mutex::new(None),
            writer: Mutex::new(()),
            foreign_keys: std::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the backing database.
    pub fn database_name(&self) -> &DatabaseName {
        &self.database_name
    }

    /// Declared logical schema.
    pub fn schema(&self) -> &LogicalSchema {
        &self.schema
    }

    /// Translation map shared with the owning context.
    pub fn translations(&self) -> &Arc<TranslationMap> {
        &self.translations
    }

    /// Converge the database onto the logical schema, once.
    ///
    /// Concurrent callers wait for the first convergence and share its
    /// report. After a failure the next call starts over.
    pub async fn initialize(&self) -> Result<MigrationReport> {
        Ok(self.converged().await?.1)
    }

    /// Open database handle, converging again if the previous one went stale.
    pub async fn database(&self) -> Result<Database> {
        Ok(self.converged().await?.0)
    }

    async fn converged(&self) -> Result<(Database, MigrationReport)> {
        let mut init = self.init.lock().await;
        if let Some((database, report)) = init.as_ref() {
            if !database.is_stale() {
                return Ok((database.clone(), report.clone()));
            }
            debug!("Database of '{}' went stale, converging again", self.name);
        }

        let (database, report) = self.manager.converge(&self.database_name, &self.schema).await?;
        if !report.is_noop() {
            info!("Initialized '{}' at version {}", self.name, report.version);
        }
        *init = Some((database.clone(), report.clone()));
        Ok((database, report))
    }

    async fn table(&self, name: &str) -> Result<(Database, Table)> {
        let database = self.database().await?;
        let table = database.table(name)?;
        Ok((database, table))
    }

    /// Run a selector against the local cache, pushing results to `sink`.
    ///
    /// Initialization failures and missing tables go to `sink.data_error`.
    pub async fn fetch(&self, selector: &Selector, sink: &mut dyn ResultSink) {
        query::deliver(self.fetch_rows(selector).await, sink);
    }

    /// Run a selector against the local cache.
    pub async fn fetch_rows(&self, selector: &Selector) -> Result<Vec<Row>> {
        let (_, table) = self.table(&selector.table).await?;
        let rows = selector.evaluate(table.all().await?);
        debug!("Fetched {} rows from '{}.{}'", rows.len(), self.name, selector.table);
        Ok(rows)
    }

    /// Replace the cached result of `selector` with an authoritative result.
    ///
    /// Cached rows matching `selector` that are absent from `rows` are
    /// pruned along with their journal entries. Old fetch markers of the
    /// table are replaced by one fresh marker per incoming row. Everything
    /// commits in one transaction over the table and the journal.
    ///
    /// # Errors
    /// - `InvalidInput` when an incoming row has no primary key
    /// - `Transaction` when the commit fails; nothing is applied
    pub async fn write_authoritative(
        &self,
        table: &str,
        rows: &[Row],
        selector: &Selector,
    ) -> Result<AuthoritativeWrite> {
        let _writer = self.writer.lock().await;
        let (database, data) = self.table(table).await?;
        let journal = OperationJournal::new(database.clone());

        let keys: Vec<Key> = rows.iter().map(|row| data.key_of(row)).collect::<Result<_>>()?;
        let incoming: HashSet<&Key> = keys.iter().collect();
        let mut pruned = Vec::new();
        for row in selector.evaluate(data.all().await?) {
            let key = data.key_of(&row)?;
            if !incoming.contains(&key) {
                pruned.push(key);
            }
        }

        let mut stale: BTreeMap<Key, JournalEntry> = BTreeMap::new();
        let pruned_set: HashSet<Key> = pruned.iter().cloned().collect();
        for entry in journal
            .fetch_markers(Some(table))
            .await?
            .into_iter()
            .chain(journal.entries_for(table, &pruned_set).await?)
        {
            stale.insert(entry.key()?, entry);
        }
        let stale: Vec<JournalEntry> = stale.into_values().collect();

        let mut batch = WriteBatch::new([table, JOURNAL_TABLE]);
        OperationJournal::stage_removal(&mut batch, &stale)?;
        for row in rows {
            batch.put(table, row.clone());
        }
        OperationJournal::stage_fetch_markers(&mut batch, table, &keys, now_millis())?;
        for key in &pruned {
            batch.delete(table, key.clone());
        }
        database.commit(batch).await?;

        if !pruned.is_empty() {
            self.graph.remove_dependents(&self.name, table, &pruned).await?;
        }

        info!(
            "Cached {} authoritative rows of '{}.{}', pruned {}",
            rows.len(),
            self.name,
            table,
            pruned.len()
        );
        Ok(AuthoritativeWrite {
            upserted: rows.len(),
            pruned,
            journal_removed: stale.len(),
        })
    }

    /// [`OfflineService::write_authoritative`] for callers that already
    /// succeeded online: failures only leave the cache stale and are logged.
    pub async fn cache_authoritative(&self, table: &str, rows: &[Row], selector: &Selector) {
        if let Err(e) = self.write_authoritative(table, rows, selector).await {
            warn!("Offline cache of '{}.{}' left stale: {}", self.name, table, e);
        }
    }

    /// Create rows offline.
    ///
    /// Rows lacking a primary key get a freshly minted offline identifier.
    /// Rows and their `create` journal entries commit together; then minted
    /// identifiers and foreign-key references to minted identifiers are
    /// registered for reconciliation.
    ///
    /// Returns the rows as stored, keys included.
    pub async fn create_local(&self, table: &str, rows: Vec<Row>, context: Option<Value>) -> Result<Vec<Row>> {
        let _writer = self.writer.lock().await;
        let (database, data) = self.table(table).await?;
        let primary_key = data.primary_key().to_string();

        let mut minted = Vec::new();
        let mut created = Vec::with_capacity(rows.len());
        for mut row in rows {
            if is_blank(row.get(&primary_key)) {
                let key = Uuid::new_v4().to_string();
                row.insert(primary_key.clone(), Value::String(key.clone()));
                minted.push(key);
            }
            created.push(row);
        }

        let modified_at = now_millis();
        let mut batch = WriteBatch::new([table, JOURNAL_TABLE]);
        for row in &created {
            let key = data.key_of(row)?;
            batch.add(table, row.clone());
            OperationJournal::stage_mutation(
                &mut batch,
                table,
                Operation::Create,
                key,
                row.clone(),
                context.clone(),
                modified_at,
            )?;
        }
        database.commit(batch).await?;
        debug!("Created {} rows in '{}.{}' offline", created.len(), self.name, table);

        self.graph.record_minted(&minted).await?;
        self.register_dependencies(table, &primary_key, &created).await?;
        Ok(created)
    }

    /// Replace rows offline, journaling an `update` per row.
    pub async fn update_local(&self, table: &str, rows: Vec<Row>, context: Option<Value>) -> Result<Vec<Row>> {
        let _writer = self.writer.lock().await;
        let (database, data) = self.table(table).await?;

        let modified_at = now_millis();
        let mut batch = WriteBatch::new([table, JOURNAL_TABLE]);
        for row in &rows {
            let key = data.key_of(row)?;
            batch.put(table, row.clone());
            OperationJournal::stage_mutation(
                &mut batch,
                table,
                Operation::Update,
                key,
                row.clone(),
                context.clone(),
                modified_at,
            )?;
        }
        database.commit(batch).await?;
        debug!("Updated {} rows in '{}.{}' offline", rows.len(), self.name, table);

        self.register_dependencies(table, data.primary_key(), &rows).await?;
        Ok(rows)
    }

    /// Delete rows offline, journaling a `delete` per row.
    ///
    /// Dependencies recorded for the deleted rows are dropped.
    pub async fn delete_local(&self, table: &str, rows: &[Row], context: Option<Value>) -> Result<()> {
        let _writer = self.writer.lock().await;
        let (database, data) = self.table(table).await?;

        let modified_at = now_millis();
        let mut keys = Vec::with_capacity(rows.len());
        let mut batch = WriteBatch::new([table, JOURNAL_TABLE]);
        for row in rows {
            let key = data.key_of(row)?;
            batch.delete(table, key.clone());
            OperationJournal::stage_mutation(
                &mut batch,
                table,
                Operation::Delete,
                key.clone(),
                row.clone(),
                context.clone(),
                modified_at,
            )?;
            keys.push(key);
        }
        database.commit(batch).await?;
        debug!("Deleted {} rows from '{}.{}' offline", keys.len(), self.name, table);

        self.graph.remove_dependents(&self.name, table, &keys).await?;
        Ok(())
    }

    /// Fields that may hold offline identifiers: the declared foreign keys,
    /// or else every field seen on the first rows registered for the table.
    fn candidate_fields(&self, table: &str, rows: &[Row]) -> Vec<String> {
        if let Some(declared) = self.schema.get(table).and_then(|t| t.declared_foreign_keys()) {
            return declared.to_vec();
        }

        let mut cache = self
            .foreign_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(fields) = cache.get(table) {
            return fields.clone();
        }

        let mut fields: Vec<String> = Vec::new();
        for row in rows {
            for field in row.keys() {
                if !fields.contains(field) {
                    fields.push(field.clone());
                }
            }
        }
        if !fields.is_empty() {
            cache.insert(table.to_string(), fields.clone());
        }
        fields
    }

    async fn register_dependencies(&self, table: &str, primary_key: &str, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let candidates = self.candidate_fields(table, rows);
        self.graph
            .register(&self.name, table, primary_key, &candidates, rows)
            .await?;
        Ok(())
    }

    /// Pending mutations in replay order.
    pub async fn read_pending(&self) -> Result<Vec<JournalEntry>> {
        OperationJournal::new(self.database().await?).read_pending().await
    }

    /// Fetch markers, optionally of one table.
    pub async fn read_fetch_markers(&self, table: Option<&str>) -> Result<Vec<JournalEntry>> {
        OperationJournal::new(self.database().await?)
            .fetch_markers(table)
            .await
    }

    /// Remove journal entries once they have been replayed.
    pub async fn clear_operations(&self, entries: &[JournalEntry]) -> Result<()> {
        let _writer = self.writer.lock().await;
        OperationJournal::new(self.database().await?).clear(entries).await
    }

    /// Empty every data table and the journal, keeping the schema.
    pub async fn clear_all_tables(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        self.database().await?.clear_all().await
    }

    /// Delete the service database. The next operation recreates it.
    pub async fn delete_database(&self) -> Result<()> {
        let _writer = self.writer.lock().await;
        let mut init = self.init.lock().await;
        self.store.delete(&self.database_name).await?;
        *init = None;
        self.foreign_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    /// Move the row stored under `from` to `to`, with its key field updated.
    ///
    /// No journal entry is written. Returns `false` when no row is stored
    /// under `from`.
    pub(crate) async fn rekey_row(&self, table: &str, from: &Key, to: &Key) -> Result<bool> {
        let _writer = self.writer.lock().await;
        let (database, data) = self.table(table).await?;

        let Some(mut row) = data.get(from).await? else {
            warn!("No '{}.{}' row stored under {} to re-key", self.name, table, from);
            return Ok(false);
        };
        row.insert(data.primary_key().to_string(), to.to_value());

        let mut batch = WriteBatch::new([table]);
        batch.delete(table, from.clone());
        batch.put(table, row);
        database.commit(batch).await?;
        debug!("Re-keyed '{}.{}' row {} to {}", self.name, table, from, to);
        Ok(true)
    }

    /// Set `field` of row `key` to `to` if it still holds `from`.
    ///
    /// No journal entry is written. Returns `false` when the row is gone or
    /// the field no longer holds `from`.
    pub(crate) async fn patch_foreign_key(
        &self,
        table: &str,
        key: &Key,
        field: &str,
        from: &str,
        to: &Key,
    ) -> Result<bool> {
        let _writer = self.writer.lock().await;
        let (database, data) = self.table(table).await?;

        let Some(row) = data.get(key).await? else {
            warn!("Dependent '{}.{}' row {} is gone", self.name, table, key);
            return Ok(false);
        };
        if row.get(field).and_then(Value::as_str) != Some(from) {
            return Ok(false);
        }

        let mut changes = Row::new();
        changes.insert(field.to_string(), to.to_value());
        let mut batch = WriteBatch::new([table]);
        batch.update(table, key.clone(), changes);
        database.commit(batch).await?;
        Ok(true)
    }
}

impl std::fmt::Debug for OfflineService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineService")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish()
    }
}
