//! SQLite-backed storage engine.
//!
//! Each database lives in its own file under the engine root, named after the
//! percent-encoded database name. A file holds three catalog tables:
//! `__meta` (schema version), `__tables` (definition strings and the next
//! auto-increment id) and `__rows` (JSON row bodies keyed by table and
//! encoded primary key). Flags live in a separate `flags.sqlite` file.

use async_trait::async_trait;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

use offlinekit_common::{Error, Key, Result, Row};

use crate::engine::{assign_key, merge_changes, upgraded_schema, CommitReceipt, StorageEngine, WriteBatch, WriteOp};
use crate::schema::{DatabaseSchema, TableSchema};

const FILE_NAME: &AsciiSet = &NON_ALPHANUMERIC.remove(b'_').remove(b'-');
const EXTENSION: &str = "db";

const CATALOG: &str = r#"
    CREATE TABLE IF NOT EXISTS __meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS __tables (
        name TEXT PRIMARY KEY,
        definition TEXT NOT NULL,
        next_id INTEGER NOT NULL DEFAULT 1
    );

    CREATE TABLE IF NOT EXISTS __rows (
        tbl TEXT NOT NULL,
        key TEXT NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (tbl, key)
    );
"#;

/// SQLite storage engine.
///
/// Stores every database as a file in a root directory.
pub struct SqliteEngine {
    root: PathBuf,
    connections: Mutex<HashMap<String, Connection>>,
    flags: Mutex<Connection>,
}

impl SqliteEngine {
    /// Open an engine rooted at a directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    /// - Flag store is initialized
    ///
    /// # Errors
    /// - Permission denied
    /// - Flag store cannot be opened
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        let flags = Connection::open(root.join("flags.sqlite")).map_err(sql)?;
        flags
            .execute_batch("CREATE TABLE IF NOT EXISTS flags (key TEXT PRIMARY KEY, value TEXT NOT NULL);")
            .map_err(sql)?;

        info!("SQLite engine opened at {}", root.display());
        Ok(Self {
            root,
            connections: Mutex::new(HashMap::new()),
            flags: Mutex::new(flags),
        })
    }

    /// Root directory of this engine.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_path(&self, database: &str) -> PathBuf {
        self.root.join(format!(
            "{}.{}",
            utf8_percent_encode(database, FILE_NAME),
            EXTENSION
        ))
    }

    /// Run `f` against the connection for `database`, opening it on demand.
    /// Without `create`, a database with no file is reported missing.
    fn with_conn<T>(
        &self,
        database: &str,
        create: bool,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut connections = self.connections.lock().map_err(poisoned)?;

        if !connections.contains_key(database) {
            let path = self.file_path(database);
            if !create && !path.exists() {
                return Err(missing(database));
            }
            let conn = Connection::open(&path).map_err(sql)?;
            conn.execute_batch(CATALOG).map_err(sql)?;
            debug!("Opened database file {}", path.display());
            connections.insert(database.to_string(), conn);
        }

        let conn = connections
            .get_mut(database)
            .ok_or_else(|| missing(database))?;
        f(conn)
    }
}

fn sql(e: rusqlite::Error) -> Error {
    Error::Storage(format!("SQLite error: {}", e))
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Storage("SQLite engine lock poisoned".to_string())
}

fn missing(database: &str) -> Error {
    Error::DatabaseMissing(format!("Database '{}' does not exist", database))
}

/// Keys are stored as their JSON text: numbers bare, strings quoted.
fn encode_key(key: &Key) -> String {
    key.to_value().to_string()
}

fn decode_key(text: &str) -> Result<Key> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    Key::from_value(&value)
}

fn encode_row(row: &Row) -> Result<String> {
    Ok(serde_json::to_string(row)?)
}

fn decode_row(text: &str) -> Result<Row> {
    Ok(serde_json::from_str(text)?)
}

fn load_schema(conn: &Connection) -> Result<Option<DatabaseSchema>> {
    let version: Option<String> = conn
        .query_row("SELECT value FROM __meta WHERE key = 'version'", [], |row| row.get(0))
        .optional()
        .map_err(sql)?;

    let Some(version) = version else {
        return Ok(None);
    };
    let version: u32 = version
        .parse()
        .map_err(|_| Error::Storage(format!("Corrupt schema version '{}'", version)))?;

    let mut stmt = conn
        .prepare("SELECT name, definition FROM __tables")
        .map_err(sql)?;
    let tables = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(sql)?;

    let mut schema = DatabaseSchema::new(version);
    for table in tables {
        let (name, definition) = table.map_err(sql)?;
        schema.tables.insert(name, TableSchema::parse(&definition)?);
    }
    Ok(Some(schema))
}

fn load_table(conn: &Connection, database: &str, table: &str) -> Result<TableSchema> {
    let schema = load_schema(conn)?.ok_or_else(|| missing(database))?;
    schema.table(table).cloned().ok_or_else(|| {
        Error::DatabaseMissing(format!("Table '{}' not found in '{}'", table, database))
    })
}

fn read_row(conn: &Connection, table: &str, key: &Key) -> Result<Option<Row>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM __rows WHERE tbl = ?1 AND key = ?2",
            params![table, encode_key(key)],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql)?;
    body.map(|b| decode_row(&b)).transpose()
}

#[async_trait]
impl StorageEngine for SqliteEngine {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn exists(&self, database: &str) -> Result<bool> {
        Ok(self.schema(database).await?.is_some())
    }

    async fn databases(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let name = percent_decode_str(stem)
                .decode_utf8()
                .map_err(|e| Error::Storage(format!("Invalid database file name: {}", e)))?
                .into_owned();
            if self.exists(&name).await? {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn schema(&self, database: &str) -> Result<Option<DatabaseSchema>> {
        match self.with_conn(database, false, |conn| load_schema(conn)) {
            Err(Error::DatabaseMissing(_)) => Ok(None),
            other => other,
        }
    }

    async fn apply_schema(&self, database: &str, schema: &DatabaseSchema) -> Result<()> {
        self.with_conn(database, true, |conn| {
            let target = match load_schema(conn)? {
                Some(current) => upgraded_schema(database, &current, schema)?,
                None => schema.clone(),
            };

            let tx = conn.transaction().map_err(sql)?;
            tx.execute(
                "INSERT OR REPLACE INTO __meta (key, value) VALUES ('version', ?1)",
                params![target.version.to_string()],
            )
            .map_err(sql)?;
            for (name, table) in &target.tables {
                tx.execute(
                    r#"
                    INSERT INTO __tables (name, definition) VALUES (?1, ?2)
                    ON CONFLICT(name) DO UPDATE SET definition = excluded.definition
                    "#,
                    params![name, table.to_string()],
                )
                .map_err(sql)?;
            }
            tx.commit().map_err(sql)?;

            debug!("Database '{}' now at version {}", database, target.version);
            Ok(())
        })
    }

    async fn delete(&self, database: &str) -> Result<()> {
        // Close the connection before removing the file.
        self.connections.lock().map_err(poisoned)?.remove(database);

        let path = self.file_path(database);
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
            debug!("Deleted database file {}", path.display());
        }
        Ok(())
    }

    async fn scan(&self, database: &str, table: &str) -> Result<Vec<Row>> {
        self.with_conn(database, false, |conn| {
            load_table(conn, database, table)?;

            let mut stmt = conn
                .prepare("SELECT key, body FROM __rows WHERE tbl = ?1")
                .map_err(sql)?;
            let stored = stmt
                .query_map(params![table], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(sql)?;

            let mut rows = Vec::new();
            for entry in stored {
                let (key, body) = entry.map_err(sql)?;
                rows.push((decode_key(&key)?, decode_row(&body)?));
            }
            rows.sort_by(|a, b| a.0.cmp(&b.0));
            Ok(rows.into_iter().map(|(_, row)| row).collect())
        })
    }

    async fn get(&self, database: &str, table: &str, key: &Key) -> Result<Option<Row>> {
        self.with_conn(database, false, |conn| {
            load_table(conn, database, table)?;
            read_row(conn, table, key)
        })
    }

    async fn commit(&self, database: &str, batch: WriteBatch) -> Result<CommitReceipt> {
        self.with_conn(database, false, move |conn| {
            let schema = load_schema(conn)?.ok_or_else(|| missing(database))?;
            batch.validate(database, &schema)?;

            // Dropping the transaction on an early return rolls it back.
            let tx = conn.transaction().map_err(sql)?;

            let mut next_ids: HashMap<String, u64> = HashMap::new();
            for name in batch.scope() {
                let next: i64 = tx
                    .query_row(
                        "SELECT next_id FROM __tables WHERE name = ?1",
                        params![name],
                        |row| row.get(0),
                    )
                    .map_err(sql)?;
                next_ids.insert(name.clone(), next.max(1) as u64);
            }

            let mut receipt = CommitReceipt::default();
            for op in batch.into_ops() {
                let name = op.table().to_string();
                let table = schema.table(&name).ok_or_else(|| {
                    Error::Transaction(format!("Table '{}' does not exist", name))
                })?;

                match op {
                    WriteOp::Add { row, .. } => {
                        let next = next_ids.entry(name.clone()).or_insert(1);
                        let (key, row) = assign_key(table, row, next)?;
                        let inserted = tx
                            .execute(
                                "INSERT OR IGNORE INTO __rows (tbl, key, body) VALUES (?1, ?2, ?3)",
                                params![name, encode_key(&key), encode_row(&row)?],
                            )
                            .map_err(sql)?;
                        if inserted == 0 {
                            return Err(Error::Transaction(format!(
                                "Key {} already exists in '{}'",
                                key, database
                            )));
                        }
                        receipt.keys.push(key);
                    }
                    WriteOp::Put { row, .. } => {
                        let next = next_ids.entry(name.clone()).or_insert(1);
                        let (key, row) = assign_key(table, row, next)?;
                        tx.execute(
                            "INSERT OR REPLACE INTO __rows (tbl, key, body) VALUES (?1, ?2, ?3)",
                            params![name, encode_key(&key), encode_row(&row)?],
                        )
                        .map_err(sql)?;
                        receipt.keys.push(key);
                    }
                    WriteOp::Update { key, changes, .. } => {
                        if let Some(existing) = read_row(&tx, &name, &key)? {
                            let merged = merge_changes(table, &key, existing, changes)?;
                            tx.execute(
                                "UPDATE __rows SET body = ?3 WHERE tbl = ?1 AND key = ?2",
                                params![name, encode_key(&key), encode_row(&merged)?],
                            )
                            .map_err(sql)?;
                        }
                    }
                    WriteOp::Delete { key, .. } => {
                        tx.execute(
                            "DELETE FROM __rows WHERE tbl = ?1 AND key = ?2",
                            params![name, encode_key(&key)],
                        )
                        .map_err(sql)?;
                    }
                }
            }

            for (name, next) in next_ids {
                tx.execute(
                    "UPDATE __tables SET next_id = ?2 WHERE name = ?1",
                    params![name, next as i64],
                )
                .map_err(sql)?;
            }
            tx.commit().map_err(sql)?;
            Ok(receipt)
        })
    }

    async fn read_flag(&self, key: &str) -> Result<Option<String>> {
        let flags = self.flags.lock().map_err(poisoned)?;
        flags
            .query_row("SELECT value FROM flags WHERE key = ?1", params![key], |row| row.get(0))
            .optional()
            .map_err(sql)
    }

    async fn write_flag(&self, key: &str, value: &str) -> Result<()> {
        let flags = self.flags.lock().map_err(poisoned)?;
        flags
            .execute(
                "INSERT OR REPLACE INTO flags (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
            .map_err(sql)?;
        Ok(())
    }

    async fn remove_flag(&self, key: &str) -> Result<()> {
        let flags = self.flags.lock().map_err(poisoned)?;
        flags
            .execute("DELETE FROM flags WHERE key = ?1", params![key])
            .map_err(sql)?;
        Ok(())
    }
}
