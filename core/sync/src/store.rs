//! Local Store: named, versioned databases over a storage engine.
//!
//! Handles returned by the store are tied to a generation counter per
//! database name. Recreating, upgrading or deleting a database advances the
//! counter, and every handle obtained earlier then fails with
//! [`Error::StaleHandle`] until it is re-resolved.
//!
//! Recreation is an explicit four-phase state machine. The phase about to
//! run is persisted as a flag before it starts, so an interrupted recreate can
//! be finished by [`LocalStore::recover_interrupted`]:
//!
//! | Phase            | Source of truth while running |
//! |------------------|-------------------------------|
//! | `CopyToTemp`     | original                      |
//! | `DeleteOriginal` | temp                          |
//! | `CopyBack`       | temp                          |
//! | `DeleteTemp`     | original                      |

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};

use offlinekit_common::{DatabaseName, Error, Key, Result, Row};
use offlinekit_storage::{CommitReceipt, DatabaseSchema, StorageEngine, TableSchema, WriteBatch};

/// Row rewrite applied per table while copying into the temp database.
pub type RowTransform<'a> = dyn Fn(&str, Row) -> Row + Send + Sync + 'a;

/// Phase of an in-progress recreate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreatePhase {
    /// Copying the original into the temp database.
    CopyToTemp,
    /// Deleting the original.
    DeleteOriginal,
    /// Copying the temp database back under the original name.
    CopyBack,
    /// Deleting the temp database.
    DeleteTemp,
}

impl RecreatePhase {
    /// Flag value persisted for this phase.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecreatePhase::CopyToTemp => "copy_to_temp",
            RecreatePhase::DeleteOriginal => "delete_original",
            RecreatePhase::CopyBack => "copy_back",
            RecreatePhase::DeleteTemp => "delete_temp",
        }
    }

    /// Parse a persisted flag value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "copy_to_temp" => Some(RecreatePhase::CopyToTemp),
            "delete_original" => Some(RecreatePhase::DeleteOriginal),
            "copy_back" => Some(RecreatePhase::CopyBack),
            "delete_temp" => Some(RecreatePhase::DeleteTemp),
            _ => None,
        }
    }
}

impl fmt::Display for RecreatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Flag key holding the recreate phase of a database.
pub fn recreate_phase_flag(name: &DatabaseName) -> String {
    format!("{}.recreate_phase", name)
}

/// Generation snapshot carried by every handle.
#[derive(Debug, Clone)]
struct Generation {
    counter: Arc<AtomicU64>,
    value: u64,
}

impl Generation {
    fn check(&self, what: &str) -> Result<()> {
        if self.counter.load(Ordering::SeqCst) != self.value {
            return Err(Error::StaleHandle(format!(
                "{} was recreated or deleted; re-resolve the handle",
                what
            )));
        }
        Ok(())
    }

    fn is_current(&self) -> bool {
        self.counter.load(Ordering::SeqCst) == self.value
    }
}

/// Handle to one table of an open database.
#[derive(Clone)]
pub struct Table {
    engine: Arc<dyn StorageEngine>,
    database: DatabaseName,
    name: String,
    schema: TableSchema,
    generation: Generation,
}

impl Table {
    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning database.
    pub fn database(&self) -> &DatabaseName {
        &self.database
    }

    /// Physical layout.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Primary key field name.
    pub fn primary_key(&self) -> &str {
        &self.schema.primary_key
    }

    /// Read the primary key of a row of this table.
    pub fn key_of(&self, row: &Row) -> Result<Key> {
        Key::from_row(row, &self.schema.primary_key)
    }

    /// Every row in primary key order.
    pub async fn all(&self) -> Result<Vec<Row>> {
        self.generation.check(&self.describe())?;
        self.engine.scan(self.database.as_str(), &self.name).await
    }

    /// One row by primary key.
    pub async fn get(&self, key: &Key) -> Result<Option<Row>> {
        self.generation.check(&self.describe())?;
        self.engine.get(self.database.as_str(), &self.name, key).await
    }

    fn describe(&self) -> String {
        format!("Table '{}' of '{}'", self.name, self.database)
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("database", &self.database)
            .field("name", &self.name)
            .field("schema", &self.schema)
            .finish()
    }
}

struct DatabaseInner {
    engine: Arc<dyn StorageEngine>,
    name: DatabaseName,
    schema: DatabaseSchema,
    generation: Generation,
    tables: Mutex<HashMap<String, Table>>,
}

/// Handle to an open database.
///
/// Cheap to clone. Table handles are cached per database handle.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Database name.
    pub fn name(&self) -> &DatabaseName {
        &self.inner.name
    }

    /// Physical schema at the time the handle was opened.
    pub fn schema(&self) -> &DatabaseSchema {
        &self.inner.schema
    }

    /// Schema version.
    pub fn version(&self) -> u32 {
        self.inner.schema.version
    }

    /// Check if this handle was invalidated by a recreate, upgrade or delete.
    pub fn is_stale(&self) -> bool {
        !self.inner.generation.is_current()
    }

    /// Resolve a table handle.
    ///
    /// # Errors
    /// - Handle is stale
    /// - Table does not exist
    pub fn table(&self, name: &str) -> Result<Table> {
        self.inner
            .generation
            .check(&format!("Database '{}'", self.inner.name))?;

        let mut tables = self.inner.tables.lock().map_err(poisoned)?;
        if let Some(table) = tables.get(name) {
            return Ok(table.clone());
        }

        let schema = self.inner.schema.table(name).cloned().ok_or_else(|| {
            Error::DatabaseMissing(format!(
                "Table '{}' does not exist in '{}'",
                name, self.inner.name
            ))
        })?;
        let table = Table {
            engine: self.inner.engine.clone(),
            database: self.inner.name.clone(),
            name: name.to_string(),
            schema,
            generation: self.inner.generation.clone(),
        };
        tables.insert(name.to_string(), table.clone());
        Ok(table)
    }

    /// Apply a write batch atomically.
    ///
    /// # Errors
    /// - Handle is stale
    /// - Any operation fails; nothing is applied
    pub async fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt> {
        self.inner
            .generation
            .check(&format!("Database '{}'", self.inner.name))?;

        let ops = batch.len();
        match self.inner.engine.commit(self.inner.name.as_str(), batch).await {
            Ok(receipt) => {
                debug!("Committed {} operations to '{}'", ops, self.inner.name);
                Ok(receipt)
            }
            Err(e) => {
                error!("Transaction on '{}' rolled back: {}", self.inner.name, e);
                Err(e)
            }
        }
    }

    /// Empty every table while keeping the schema.
    pub async fn clear_all(&self) -> Result<()> {
        let names: Vec<String> = self.inner.schema.tables.keys().cloned().collect();
        let mut batch = WriteBatch::new(names.iter().cloned());
        for name in &names {
            let table = self.table(name)?;
            for row in table.all().await? {
                batch.delete(name, table.key_of(&row)?);
            }
        }
        self.commit(batch).await?;
        info!("Cleared all tables of '{}'", self.inner.name);
        Ok(())
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.inner.name)
            .field("version", &self.inner.schema.version)
            .finish()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Storage("Local store lock poisoned".to_string())
}

fn migration_error(name: &DatabaseName, phase: RecreatePhase, e: Error) -> Error {
    error!("Recreating '{}' failed during {}: {}", name, phase, e);
    match e {
        Error::SchemaMigration(_) => e,
        other => Error::SchemaMigration(format!(
            "Recreating '{}' failed during {}: {}",
            name, phase, other
        )),
    }
}

/// Local Store over a storage engine.
pub struct LocalStore {
    engine: Arc<dyn StorageEngine>,
    generations: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl LocalStore {
    /// Create a store over an engine.
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            engine,
            generations: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying engine.
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Check if a database exists.
    pub async fn exists(&self, name: &DatabaseName) -> Result<bool> {
        self.engine.exists(name.as_str()).await
    }

    /// Names of every physically present database.
    pub async fn databases(&self) -> Result<Vec<String>> {
        self.engine.databases().await
    }

    /// Physical schema of a database, `None` when absent.
    pub async fn schema(&self, name: &DatabaseName) -> Result<Option<DatabaseSchema>> {
        self.engine.schema(name.as_str()).await
    }

    /// Open a database, creating it with `schema` when absent.
    ///
    /// An existing database is opened as is; `schema` is not applied to it.
    pub async fn open(&self, name: &DatabaseName, schema: &DatabaseSchema) -> Result<Database> {
        if !self.exists(name).await? {
            self.engine.apply_schema(name.as_str(), schema).await?;
            info!("Created database '{}' at version {}", name, schema.version);
        }
        self.open_existing(name)
            .await?
            .ok_or_else(|| Error::DatabaseMissing(format!("Database '{}' does not exist", name)))
    }

    /// Open a database only if it exists.
    pub async fn open_existing(&self, name: &DatabaseName) -> Result<Option<Database>> {
        let Some(schema) = self.schema(name).await? else {
            return Ok(None);
        };
        let counter = self.counter(name)?;
        let value = counter.load(Ordering::SeqCst);

        Ok(Some(Database {
            inner: Arc::new(DatabaseInner {
                engine: self.engine.clone(),
                name: name.clone(),
                schema,
                generation: Generation { counter, value },
                tables: Mutex::new(HashMap::new()),
            }),
        }))
    }

    /// Upgrade an existing database in place to `schema`.
    ///
    /// # Postconditions
    /// - Handles obtained before the upgrade are stale
    ///
    /// # Errors
    /// - Version does not increase
    /// - An existing table's primary key would change
    pub async fn upgrade(&self, name: &DatabaseName, schema: &DatabaseSchema) -> Result<Database> {
        self.invalidate(name)?;
        self.engine.apply_schema(name.as_str(), schema).await?;
        info!("Upgraded database '{}' in place to version {}", name, schema.version);
        self.open_existing(name)
            .await?
            .ok_or_else(|| Error::DatabaseMissing(format!("Database '{}' does not exist", name)))
    }

    /// Delete a database. Deleting a missing database is not an error.
    pub async fn delete(&self, name: &DatabaseName) -> Result<()> {
        self.invalidate(name)?;
        self.engine.delete(name.as_str()).await?;
        info!("Deleted database '{}'", name);
        Ok(())
    }

    /// Recreate a database under a new schema, preserving rows.
    ///
    /// Runs copy-to-temp, delete-original, copy-back and delete-temp in
    /// order, each phase starting only after the previous one committed.
    /// `schema` overrides table layouts; tables it does not mention keep
    /// their current layout. Without it the current layout is reused.
    ///
    /// # Preconditions
    /// - Database exists
    ///
    /// # Postconditions
    /// - Every row of every kept table is present under the new layout,
    ///   except journal rows when `omit_table` names the journal
    /// - Handles obtained before the recreate are stale
    ///
    /// # Errors
    /// - `SchemaMigration` when any phase fails; the phase flag is left in
    ///   place for [`LocalStore::recover_interrupted`]
    pub async fn recreate(
        &self,
        name: &DatabaseName,
        schema: Option<&DatabaseSchema>,
        omit_table: Option<&str>,
        transform: Option<&RowTransform<'_>>,
    ) -> Result<Database> {
        let current = self.schema(name).await?.ok_or_else(|| {
            Error::SchemaMigration(format!("Cannot recreate missing database '{}'", name))
        })?;

        let mut target = current.clone();
        if let Some(schema) = schema {
            for (table, layout) in &schema.tables {
                target.tables.insert(table.clone(), layout.clone());
            }
            target.version = schema.version;
        }
        target.version = target.version.max(current.version + 1);

        let temp = name.temp();
        self.invalidate(name)?;
        info!(
            "Recreating '{}' from version {} to {} via '{}'",
            name, current.version, target.version, temp
        );

        let phase = RecreatePhase::CopyToTemp;
        self.set_phase(name, phase).await?;
        self.copy_to_temp(name, &temp, &current, &target, omit_table, transform)
            .await
            .map_err(|e| migration_error(name, phase, e))?;

        let phase = RecreatePhase::DeleteOriginal;
        self.set_phase(name, phase).await?;
        self.engine
            .delete(name.as_str())
            .await
            .map_err(|e| migration_error(name, phase, e))?;

        self.finish_from_temp(name, &temp).await?;
        info!("Recreated '{}' at version {}", name, target.version);

        self.open_existing(name)
            .await?
            .ok_or_else(|| Error::SchemaMigration(format!("Database '{}' vanished after recreate", name)))
    }

    /// Finish a recreate that was interrupted by a crash.
    ///
    /// Returns `true` when anything was recovered.
    ///
    /// # Errors
    /// - `SchemaMigration` when the copy-back cannot be redone
    pub async fn recover_interrupted(&self, name: &DatabaseName) -> Result<bool> {
        let flag = recreate_phase_flag(name);
        let temp = name.temp();
        let marker = self.engine.read_flag(&flag).await?;

        let phase = match marker.as_deref().map(|m| (m, RecreatePhase::parse(m))) {
            Some((_, Some(phase))) => phase,
            Some((value, None)) => {
                warn!("Ignoring unknown recreate phase '{}' for '{}'", value, name);
                self.engine.remove_flag(&flag).await?;
                return Ok(false);
            }
            None => return Ok(false),
        };

        warn!("Recovering '{}' interrupted during {}", name, phase);
        self.invalidate(name)?;

        match phase {
            RecreatePhase::CopyToTemp => {
                self.drop_temp(&temp).await?;
                self.engine.remove_flag(&flag).await?;
            }
            RecreatePhase::DeleteOriginal | RecreatePhase::CopyBack => {
                if self.exists(&temp).await? {
                    self.engine.delete(name.as_str()).await?;
                    self.finish_from_temp(name, &temp).await?;
                } else {
                    warn!("No '{}' to restore '{}' from", temp, name);
                    self.engine.remove_flag(&flag).await?;
                }
            }
            RecreatePhase::DeleteTemp => {
                self.drop_temp(&temp).await?;
                self.engine.remove_flag(&flag).await?;
            }
        }
        Ok(true)
    }

    /// Run copy-back and delete-temp, then clear the phase flag.
    async fn finish_from_temp(&self, name: &DatabaseName, temp: &DatabaseName) -> Result<()> {
        let phase = RecreatePhase::CopyBack;
        self.set_phase(name, phase).await?;
        let schema = self.schema(temp).await?.ok_or_else(|| {
            migration_error(
                name,
                phase,
                Error::DatabaseMissing(format!("Database '{}' does not exist", temp)),
            )
        })?;
        self.copy_database(temp, name, &schema, &schema, None, None)
            .await
            .map_err(|e| migration_error(name, phase, e))?;

        let phase = RecreatePhase::DeleteTemp;
        self.set_phase(name, phase).await?;
        self.drop_temp(temp)
            .await
            .map_err(|e| migration_error(name, phase, e))?;

        self.engine.remove_flag(&recreate_phase_flag(name)).await
    }

    async fn drop_temp(&self, temp: &DatabaseName) -> Result<()> {
        self.invalidate(temp)?;
        self.engine.delete(temp.as_str()).await
    }

    async fn copy_to_temp(
        &self,
        name: &DatabaseName,
        temp: &DatabaseName,
        current: &DatabaseSchema,
        target: &DatabaseSchema,
        omit_table: Option<&str>,
        transform: Option<&RowTransform<'_>>,
    ) -> Result<()> {
        // A leftover temp from an earlier failure must not leak rows.
        self.drop_temp(temp).await?;
        self.copy_database(name, temp, current, target, omit_table, transform)
            .await
    }

    /// Create `to` with `target` and copy every row of `from` into it in one
    /// transaction.
    async fn copy_database(
        &self,
        from: &DatabaseName,
        to: &DatabaseName,
        source: &DatabaseSchema,
        target: &DatabaseSchema,
        omit_table: Option<&str>,
        transform: Option<&RowTransform<'_>>,
    ) -> Result<()> {
        self.engine.apply_schema(to.as_str(), target).await?;

        let tables: Vec<&String> = target
            .tables
            .keys()
            .filter(|t| source.has_table(t) && Some(t.as_str()) != omit_table)
            .collect();

        let mut batch = WriteBatch::new(tables.iter().map(|t| t.to_string()));
        for table in &tables {
            for row in self.engine.scan(from.as_str(), table).await? {
                let row = match transform {
                    Some(transform) => transform(table.as_str(), row),
                    None => row,
                };
                batch.put(table, row);
            }
        }

        let rows = batch.len();
        self.engine.commit(to.as_str(), batch).await?;
        debug!("Copied {} rows from '{}' to '{}'", rows, from, to);
        Ok(())
    }

    async fn set_phase(&self, name: &DatabaseName, phase: RecreatePhase) -> Result<()> {
        debug!("Recreate of '{}' entering {}", name, phase);
        self.engine
            .write_flag(&recreate_phase_flag(name), phase.as_str())
            .await
    }

    fn counter(&self, name: &DatabaseName) -> Result<Arc<AtomicU64>> {
        let mut generations = self.generations.lock().map_err(poisoned)?;
        Ok(generations
            .entry(name.as_str().to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone())
    }

    fn invalidate(&self, name: &DatabaseName) -> Result<()> {
        self.counter(name)?.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
