//! Schema Manager: converge a physical database onto a declared logical schema.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use offlinekit_common::{DatabaseName, Error, Result, Row};
use offlinekit_storage::{DatabaseSchema, TableSchema, WriteBatch};

use crate::journal::{journal_schema, JOURNAL_TABLE};
use crate::store::{Database, LocalStore};

/// Rewrites one existing row when its table is migrated.
pub type MigrationHook = Arc<dyn Fn(Row) -> Row + Send + Sync>;

/// Declared layout of one table.
#[derive(Clone)]
pub struct LogicalTable {
    primary_key: String,
    indexes: Vec<String>,
    foreign_keys: Option<Vec<String>>,
    migration: Option<MigrationHook>,
}

impl LogicalTable {
    /// Table keyed by `primary_key`.
    pub fn new(primary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            indexes: Vec::new(),
            foreign_keys: None,
            migration: None,
        }
    }

    /// Set the secondary index fields.
    pub fn indexes<I, S>(mut self, indexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indexes = indexes.into_iter().map(Into::into).collect();
        self
    }

    /// Declare which fields may hold foreign keys. Without a declaration
    /// every field of the first rows written offline is a candidate.
    pub fn foreign_keys<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.foreign_keys = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Rewrite existing rows when this table is migrated.
    pub fn migration(mut self, hook: impl Fn(Row) -> Row + Send + Sync + 'static) -> Self {
        self.migration = Some(Arc::new(hook));
        self
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn index_fields(&self) -> &[String] {
        &self.indexes
    }

    pub fn declared_foreign_keys(&self) -> Option<&[String]> {
        self.foreign_keys.as_deref()
    }

    pub fn migration_hook(&self) -> Option<&MigrationHook> {
        self.migration.as_ref()
    }

    /// Physical layout: the primary key followed by the other indexes.
    pub fn physical(&self) -> TableSchema {
        TableSchema::new(self.primary_key.clone()).with_indexes(self.indexes.iter().cloned())
    }
}

impl fmt::Debug for LogicalTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalTable")
            .field("primary_key", &self.primary_key)
            .field("indexes", &self.indexes)
            .field("foreign_keys", &self.foreign_keys)
            .field("migration", &self.migration.is_some())
            .finish()
    }
}

/// Declared tables of one service database.
#[derive(Debug, Clone, Default)]
pub struct LogicalSchema {
    tables: BTreeMap<String, LogicalTable>,
}

impl LogicalSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a table.
    pub fn table(mut self, name: impl Into<String>, table: LogicalTable) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    /// Get a table by name.
    pub fn get(&self, name: &str) -> Option<&LogicalTable> {
        self.tables.get(name)
    }

    /// Tables by name.
    pub fn tables(&self) -> impl Iterator<Item = (&str, &LogicalTable)> {
        self.tables.iter().map(|(name, table)| (name.as_str(), table))
    }

    /// Physical schema at `version`, always including the journal.
    pub fn physical(&self, version: u32) -> DatabaseSchema {
        let mut schema = DatabaseSchema::new(version);
        for (name, table) in &self.tables {
            schema.tables.insert(name.clone(), table.physical());
        }
        schema.tables.insert(JOURNAL_TABLE.to_string(), journal_schema());
        schema
    }
}

/// What [`SchemaManager::converge`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// The database did not exist and was created.
    pub created: bool,
    /// An interrupted recreate was finished first.
    pub recovered: bool,
    /// The one-time journal recreation ran.
    pub journal_recreated: bool,
    /// Tables whose physical layout diverged from the logical one.
    pub divergent: Vec<String>,
    /// Divergence was resolved by a version bump.
    pub upgraded: bool,
    /// Divergence required a full recreate.
    pub recreated: bool,
    /// Resulting schema version.
    pub version: u32,
}

impl MigrationReport {
    /// Number of recreate passes performed.
    pub fn recreate_count(&self) -> usize {
        usize::from(self.journal_recreated) + usize::from(self.recreated)
    }

    /// Check if nothing had to change.
    pub fn is_noop(&self) -> bool {
        !self.created
            && !self.recovered
            && !self.journal_recreated
            && !self.upgraded
            && !self.recreated
    }
}

/// Flag marking that the one-time journal recreation already ran.
pub fn journal_flag(name: &DatabaseName) -> String {
    format!("{}.is_operations_table_cleared", name)
}

/// Names of logical tables (plus the journal) whose physical layout differs:
/// absent, different primary key, or a different index set.
pub fn divergent_tables(physical: &DatabaseSchema, logical: &LogicalSchema) -> Vec<String> {
    let expected = logical.physical(physical.version);
    expected
        .tables
        .iter()
        .filter(|(name, want)| match physical.table(name) {
            None => true,
            Some(have) => !have.same_key(want) || have.index_set() != want.index_set(),
        })
        .map(|(name, _)| name.clone())
        .collect()
}

/// Converges service databases onto their logical schemas.
pub struct SchemaManager {
    store: Arc<LocalStore>,
}

impl SchemaManager {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Bring `name` in line with `logical` and open it.
    ///
    /// # Postconditions
    /// - Every logical table and the journal exist with the declared key and indexes
    /// - Running it again on the result changes nothing
    ///
    /// # Errors
    /// - `SchemaMigration` when a recreate fails; the database must not be used
    pub async fn converge(
        &self,
        name: &DatabaseName,
        logical: &LogicalSchema,
    ) -> Result<(Database, MigrationReport)> {
        let engine = self.store.engine();
        let mut report = MigrationReport {
            recovered: self.store.recover_interrupted(name).await?,
            ..MigrationReport::default()
        };

        if !self.store.exists(name).await? {
            let database = self.store.open(name, &logical.physical(1)).await?;
            engine.write_flag(&journal_flag(name), "true").await?;
            report.created = true;
            report.version = database.version();
            return Ok((database, report));
        }

        if engine.read_flag(&journal_flag(name)).await?.is_none() {
            self.recreate_journal(name).await?;
            engine.write_flag(&journal_flag(name), "true").await?;
            report.journal_recreated = true;
        }

        let current = self.store.schema(name).await?.ok_or_else(|| {
            Error::DatabaseMissing(format!("Database '{}' does not exist", name))
        })?;
        report.divergent = divergent_tables(&current, logical);

        if report.divergent.is_empty() {
            debug!("Database '{}' matches its logical schema", name);
            let database = self.store.open(name, &current).await?;
            report.version = database.version();
            return Ok((database, report));
        }

        let next = logical.physical(current.version + 1);
        let rekeyed = report.divergent.iter().any(|table| {
            match (current.table(table), next.table(table)) {
                (Some(have), Some(want)) => !have.same_key(want),
                _ => false,
            }
        });

        let hooks: BTreeMap<&str, &MigrationHook> = report
            .divergent
            .iter()
            .filter(|t| current.has_table(t))
            .filter_map(|t| logical.get(t).and_then(|l| l.migration_hook()).map(|h| (t.as_str(), h)))
            .collect();

        info!(
            "Migrating '{}' from version {} for tables {:?}",
            name, current.version, report.divergent
        );

        let database = if rekeyed {
            let transform = |table: &str, row: Row| match hooks.get(table) {
                Some(hook) => hook(row),
                None => row,
            };
            report.recreated = true;
            self.store
                .recreate(name, Some(&next), None, Some(&transform))
                .await?
        } else {
            report.upgraded = true;
            let database = self.store.upgrade(name, &next).await?;
            Self::rewrite_in_place(&database, &hooks).await?;
            database
        };

        report.version = database.version();
        Ok((database, report))
    }

    /// Recreate once with only the journal's rows dropped and its layout reset.
    async fn recreate_journal(&self, name: &DatabaseName) -> Result<()> {
        let current = self.store.schema(name).await?.ok_or_else(|| {
            Error::DatabaseMissing(format!("Database '{}' does not exist", name))
        })?;
        let schema = DatabaseSchema::new(current.version + 1).with_table(JOURNAL_TABLE, journal_schema());

        info!("Recreating '{}' once to reset its operation journal", name);
        self.store
            .recreate(name, Some(&schema), Some(JOURNAL_TABLE), None)
            .await?;
        Ok(())
    }

    async fn rewrite_in_place(
        database: &Database,
        hooks: &BTreeMap<&str, &MigrationHook>,
    ) -> Result<()> {
        if hooks.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::new(hooks.keys().map(|t| t.to_string()));
        for (name, hook) in hooks {
            for row in database.table(name)?.all().await? {
                batch.put(name, hook(row));
            }
        }
        database.commit(batch).await?;
        debug!("Rewrote migrated rows of {:?}", hooks.keys().collect::<Vec<_>>());
        Ok(())
    }
}
