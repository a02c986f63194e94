//! Physical schema descriptions.
//!
//! A table is described by a compact definition string: the primary key
//! first (prefixed with `++` when the engine assigns it), followed by the
//! secondary index fields, comma separated. `"++id,dataID,type"` is an
//! auto-incremented `id` key with two indexes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use offlinekit_common::{Error, Result};

/// Physical layout of a single table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Primary key field name.
    pub primary_key: String,
    /// Whether the engine assigns increasing integer keys.
    pub auto_increment: bool,
    /// Secondary index fields, never containing the primary key.
    pub indexes: Vec<String>,
}

impl TableSchema {
    /// Create a table keyed by `primary_key` with no indexes.
    pub fn new(primary_key: impl Into<String>) -> Self {
        Self {
            primary_key: primary_key.into(),
            auto_increment: false,
            indexes: Vec::new(),
        }
    }

    /// Create a table whose integer keys are assigned by the engine.
    pub fn auto_increment(primary_key: impl Into<String>) -> Self {
        Self {
            auto_increment: true,
            ..Self::new(primary_key)
        }
    }

    /// Append secondary indexes, skipping duplicates and the primary key.
    pub fn with_indexes<I, S>(mut self, indexes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for index in indexes {
            let index = index.into();
            if index != self.primary_key && !self.indexes.contains(&index) {
                self.indexes.push(index);
            }
        }
        self
    }

    /// Parse a definition string such as `"++id,dataID,type"`.
    ///
    /// # Errors
    /// - Definition has no primary key
    pub fn parse(definition: &str) -> Result<Self> {
        let mut fields = definition
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty());

        let first = fields.next().ok_or_else(|| {
            Error::InvalidInput(format!("Table definition '{}' has no primary key", definition))
        })?;

        let schema = match first.strip_prefix("++") {
            Some(pk) if !pk.is_empty() => Self::auto_increment(pk),
            Some(_) => {
                return Err(Error::InvalidInput(format!(
                    "Table definition '{}' has an empty auto-increment key",
                    definition
                )))
            }
            None => Self::new(first),
        };

        Ok(schema.with_indexes(fields))
    }

    /// True when both tables use the same physical key structure.
    pub fn same_key(&self, other: &TableSchema) -> bool {
        self.primary_key == other.primary_key && self.auto_increment == other.auto_increment
    }

    /// The index fields as a set.
    pub fn index_set(&self) -> BTreeSet<&str> {
        self.indexes.iter().map(String::as_str).collect()
    }
}

impl fmt::Display for TableSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.auto_increment {
            write!(f, "++")?;
        }
        write!(f, "{}", self.primary_key)?;
        for index in &self.indexes {
            write!(f, ",{}", index)?;
        }
        Ok(())
    }
}

impl FromStr for TableSchema {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Physical layout of a whole database: a version and its tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseSchema {
    /// Monotonically increasing schema version.
    pub version: u32,
    /// Tables by name.
    pub tables: BTreeMap<String, TableSchema>,
}

impl DatabaseSchema {
    /// Create an empty schema at `version`.
    pub fn new(version: u32) -> Self {
        Self {
            version,
            tables: BTreeMap::new(),
        }
    }

    /// Add or replace a table.
    pub fn with_table(mut self, name: impl Into<String>, table: TableSchema) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    /// Build a schema from `(table, definition)` pairs.
    pub fn from_definitions<'a, I>(version: u32, definitions: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut schema = Self::new(version);
        for (name, definition) in definitions {
            schema.tables.insert(name.to_string(), TableSchema::parse(definition)?);
        }
        Ok(schema)
    }

    /// Get a table by name.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Check if a table is defined.
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Definition strings by table name.
    pub fn definitions(&self) -> BTreeMap<String, String> {
        self.tables
            .iter()
            .map(|(name, table)| (name.clone(), table.to_string()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_definition() {
        let table = TableSchema::parse("id, name ,status").unwrap();
        assert_eq!(table.primary_key, "id");
        assert!(!table.auto_increment);
        assert_eq!(table.indexes, vec!["name", "status"]);
    }

    #[test]
    fn test_parse_auto_increment() {
        let table = TableSchema::parse("++id,dataID,type").unwrap();
        assert!(table.auto_increment);
        assert_eq!(table.to_string(), "++id,dataID,type");
    }

    #[test]
    fn test_parse_skips_primary_key_and_duplicates() {
        let table = TableSchema::parse("id,id,name,name").unwrap();
        assert_eq!(table.indexes, vec!["name"]);
    }

    #[test]
    fn test_parse_empty_fails() {
        assert!(TableSchema::parse("").is_err());
        assert!(TableSchema::parse(" , ").is_err());
        assert!(TableSchema::parse("++").is_err());
    }

    #[test]
    fn test_same_key() {
        let a = TableSchema::new("id").with_indexes(["x"]);
        let b = TableSchema::new("id");
        let c = TableSchema::auto_increment("id");
        assert!(a.same_key(&b));
        assert!(!a.same_key(&c));
    }

    #[test]
    fn test_database_schema_definitions() {
        let schema =
            DatabaseSchema::from_definitions(3, [("Foo", "id,name"), ("Operation", "++id")])
                .unwrap();
        assert_eq!(schema.version, 3);
        assert!(schema.has_table("Foo"));
        let defs = schema.definitions();
        assert_eq!(defs.get("Foo").map(String::as_str), Some("id,name"));
        assert_eq!(defs.get("Operation").map(String::as_str), Some("++id"));
    }
}
