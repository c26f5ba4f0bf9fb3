//! # Schema Module
//!
//! Table metadata as seen by a binding: either reflected from a live database
//! or built from explicit declarations. Mapped types and relationships are
//! resolved against this metadata, never against raw declarations.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

use crate::database::Drivers;

// ============================================================================
// Column Types
// ============================================================================

/// Data type tag of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    BigInt,
    Real,
    Text,
    Boolean,
    Blob,
    /// A reflected column with no recognizable declared type.
    Untyped,
}

impl ColumnType {
    /// Classifies a declared SQL type using SQLite's affinity rules, which also
    /// cover the common PostgreSQL and MySQL spellings.
    pub fn from_sql(sql_type: &str) -> Self {
        let upper = sql_type.to_ascii_uppercase();
        if upper.is_empty() {
            ColumnType::Untyped
        } else if upper.contains("BOOL") {
            ColumnType::Boolean
        } else if upper.contains("BIGINT") || upper.contains("INT8") {
            ColumnType::BigInt
        } else if upper.contains("INT") || upper.contains("SERIAL") {
            ColumnType::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            ColumnType::Text
        } else if upper.contains("BLOB") || upper.contains("BYTEA") || upper.contains("BINARY") {
            ColumnType::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            ColumnType::Real
        } else {
            ColumnType::Text
        }
    }

    /// The SQL spelling used when creating tables.
    pub fn sql_name(self, driver: Drivers) -> &'static str {
        match (self, driver) {
            (ColumnType::Integer, _) => "INTEGER",
            (ColumnType::BigInt, _) => "BIGINT",
            (ColumnType::Real, Drivers::SQLite) => "REAL",
            (ColumnType::Real, Drivers::Postgres) => "DOUBLE PRECISION",
            (ColumnType::Real, Drivers::MySQL) => "DOUBLE",
            (ColumnType::Text, _) | (ColumnType::Untyped, _) => "TEXT",
            (ColumnType::Boolean, _) => "BOOLEAN",
            (ColumnType::Blob, Drivers::Postgres) => "BYTEA",
            (ColumnType::Blob, _) => "BLOB",
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::BigInt)
    }
}

// ============================================================================
// Tables
// ============================================================================

/// Metadata of a single column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub column_type: ColumnType,
    /// The SQL type as declared or reflected (may be empty for SQLite).
    pub sql_type: String,
    pub primary_key: bool,
    pub nullable: bool,
    pub unique: bool,
    pub index: bool,
}

/// A single-column foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: String,
    pub target_table: String,
    pub target_column: String,
}

/// Metadata of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Primary key column names in declaration order.
    pub fn primary_key(&self) -> Vec<&str> {
        self.columns.iter().filter(|c| c.primary_key).map(|c| c.name.as_str()).collect()
    }

    /// Foreign keys of this table that reference `table`.
    pub fn foreign_keys_to<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a ForeignKey> + 'a {
        self.foreign_keys.iter().filter(move |fk| fk.target_table == table)
    }

    /// The foreign key declared on `column`, if any.
    pub fn foreign_key_on(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.column == column)
    }

    /// True when the table has a single integer primary key the database can
    /// generate on insert.
    pub fn has_generated_key(&self) -> bool {
        let pk: Vec<&ColumnSchema> = self.columns.iter().filter(|c| c.primary_key).collect();
        pk.len() == 1 && pk[0].column_type.is_integer()
    }
}

/// All tables known to a binding, mapped or not.
#[derive(Debug, Clone, Default)]
pub struct MetaData {
    tables: BTreeMap<String, Arc<TableSchema>>,
}

impl MetaData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: TableSchema) {
        self.tables.insert(table.name.clone(), Arc::new(table));
    }

    pub fn table(&self, name: &str) -> Option<&Arc<TableSchema>> {
        self.tables.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableSchema>> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
