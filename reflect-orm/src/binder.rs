//! # Binder Module
//!
//! Attaches the registered skeletons to a live database. Binding produces a
//! [`Binding`]: the bound metadata for every table plus the mapped types
//! materialized from it.
//!
//! ## Modes
//!
//! - [`Reflection::Deferred`]: every skeleton table must already exist. All
//!   tables are reflected; skeleton tables are mapped, the rest are kept as
//!   plain metadata.
//! - [`Reflection::Eager`]: tables are built from field declarations and
//!   created when absent.

use std::{collections::BTreeMap, sync::Arc};

use crate::{
    Error, Result,
    database::{Database, DatabaseBuilder},
    mapper::MappedType,
    registry::ClassRegistry,
    schema::{ColumnSchema, ColumnType, ForeignKey, MetaData, TableSchema},
    skeleton::{FieldDecl, parse_foreign_key},
};

// ============================================================================
// Connection Targets
// ============================================================================

/// How table definitions are obtained at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reflection {
    /// Reflect existing tables from the database.
    #[default]
    Deferred,
    /// Create tables from the declarations.
    Eager,
}

/// What to bind to: a live connection or a descriptor to connect with.
#[derive(Debug, Clone)]
pub enum ConnectionTarget {
    Database(Database),
    Url(String),
}

impl From<Database> for ConnectionTarget {
    fn from(database: Database) -> Self {
        ConnectionTarget::Database(database)
    }
}

impl From<&Database> for ConnectionTarget {
    fn from(database: &Database) -> Self {
        ConnectionTarget::Database(database.clone())
    }
}

impl From<&str> for ConnectionTarget {
    fn from(url: &str) -> Self {
        ConnectionTarget::Url(url.to_string())
    }
}

impl From<String> for ConnectionTarget {
    fn from(url: String) -> Self {
        ConnectionTarget::Url(url)
    }
}

// ============================================================================
// Bindings
// ============================================================================

/// The live association between registered skeletons and one database.
#[derive(Debug)]
pub struct Binding {
    pub(crate) generation: u64,
    pub(crate) database: Database,
    pub(crate) reflection: Reflection,
    pub(crate) metadata: MetaData,
    pub(crate) classes: BTreeMap<String, Arc<MappedType>>,
    /// table -> class
    pub(crate) tables: BTreeMap<String, String>,
}

impl Binding {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn reflection(&self) -> Reflection {
        self.reflection
    }

    /// Metadata of every bound table, mapped or not.
    pub fn metadata(&self) -> &MetaData {
        &self.metadata
    }

    pub fn mapped(&self, class: &str) -> Result<&Arc<MappedType>> {
        self.classes.get(class).ok_or_else(|| Error::UnknownClass(class.to_string()))
    }

    pub fn mapped_for_table(&self, table: &str) -> Option<&Arc<MappedType>> {
        self.tables.get(table).and_then(|class| self.classes.get(class))
    }

    pub fn classes(&self) -> impl Iterator<Item = &Arc<MappedType>> {
        self.classes.values()
    }

    /// Tables loaded by the binding that no class maps.
    pub fn unmapped_tables(&self) -> impl Iterator<Item = &Arc<TableSchema>> {
        self.metadata.tables().filter(|table| !self.tables.contains_key(&table.name))
    }
}

// ============================================================================
// Schema Binder
// ============================================================================

/// Resolves connection targets and binds registries to them.
#[derive(Debug, Clone, Default)]
pub struct SchemaBinder {
    reflection: Reflection,
    builder: DatabaseBuilder,
}

impl SchemaBinder {
    pub fn new(reflection: Reflection) -> Self {
        Self { reflection, builder: DatabaseBuilder::new() }
    }

    /// Pool size used when binding to a descriptor.
    pub fn max_connections(mut self, max: u32) -> Self {
        self.builder = self.builder.max_connections(max);
        self
    }

    pub fn reflection(&self) -> Reflection {
        self.reflection
    }

    /// Turns a target into a live database.
    pub async fn resolve(&self, target: ConnectionTarget) -> Result<Database> {
        match target {
            ConnectionTarget::Database(database) => Ok(database),
            ConnectionTarget::Url(url) => self.builder.clone().connect(&url).await,
        }
    }

    /// Binds `registry` to `target`, producing binding number `generation`.
    pub async fn bind(&self, registry: &ClassRegistry, target: ConnectionTarget, generation: u64) -> Result<Binding> {
        registry.table_owners()?;
        let database = self.resolve(target).await?;

        let metadata = match self.reflection {
            Reflection::Deferred => reflect_schema(&database, registry).await?,
            Reflection::Eager => create_schema(&database, registry).await?,
        };

        let classes = registry.materialize(&metadata, generation)?;
        let tables = classes.values().map(|mapped| (mapped.table_name().to_string(), mapped.name().to_string())).collect();

        let binding = Binding { generation, database, reflection: self.reflection, metadata, classes, tables };
        log::info!(
            "bound {} class(es) and {} unmapped table(s) ({:?}, generation {})",
            binding.classes.len(),
            binding.unmapped_tables().count(),
            self.reflection,
            generation
        );
        Ok(binding)
    }
}

// ============================================================================
// Deferred Reflection
// ============================================================================

async fn reflect_schema(database: &Database, registry: &ClassRegistry) -> Result<MetaData> {
    let existing = database.table_names().await?;
    for (class, skeleton) in registry.skeletons() {
        if !existing.contains(&skeleton.table) {
            return Err(Error::SchemaMismatch {
                class: class.to_string(),
                table: skeleton.table.clone(),
                detail: "table does not exist in the database".to_string(),
            });
        }
    }

    let mut tables = BTreeMap::new();
    for name in existing {
        let table = database.reflect_table(&name).await?;
        tables.insert(name, table);
    }

    resolve_implicit_targets(&mut tables);

    for (class, skeleton) in registry.skeletons() {
        let Some(table) = tables.get_mut(&skeleton.table) else { continue };
        for (attr, field) in skeleton.fields() {
            apply_declared(class, table, field.column_name(attr), field)?;
        }
    }

    let mut metadata = MetaData::new();
    for table in tables.into_values() {
        metadata.insert(table);
    }
    Ok(metadata)
}

/// Points foreign keys without a referenced column at the target's primary key.
fn resolve_implicit_targets(tables: &mut BTreeMap<String, TableSchema>) {
    let primary_keys: BTreeMap<String, String> = tables
        .values()
        .filter_map(|t| match t.primary_key().as_slice() {
            [pk] => Some((t.name.clone(), pk.to_string())),
            _ => None,
        })
        .collect();

    for table in tables.values_mut() {
        for fk in table.foreign_keys.iter_mut().filter(|fk| fk.target_column.is_empty()) {
            if let Some(pk) = primary_keys.get(&fk.target_table) {
                fk.target_column = pk.clone();
            }
        }
    }
}

/// Overrides reflected column metadata with whatever a field declares.
fn apply_declared(class: &str, table: &mut TableSchema, column: &str, field: &FieldDecl) -> Result<()> {
    let table_name = table.name.clone();
    let Some(schema) = table.columns.iter_mut().find(|c| c.name == column) else {
        return Err(Error::SchemaMismatch {
            class: class.to_string(),
            table: table_name,
            detail: format!("column `{column}` does not exist"),
        });
    };

    if let Some(column_type) = field.column_type {
        schema.column_type = column_type;
    }
    if field.primary_key {
        schema.primary_key = true;
        schema.nullable = false;
    }
    if let Some(nullable) = field.nullable {
        schema.nullable = nullable;
    }
    schema.unique |= field.unique;
    schema.index |= field.index;

    if let Some(target) = &field.foreign_key {
        let (target_table, target_column) = parse_foreign_key(target)
            .ok_or_else(|| Error::invalid_declaration(class, format!("foreign key `{target}` is not `table.column`")))?;
        table.foreign_keys.retain(|fk| fk.column != column);
        table.foreign_keys.push(ForeignKey {
            column: column.to_string(),
            target_table: target_table.to_string(),
            target_column: target_column.to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Eager Creation
// ============================================================================

async fn create_schema(database: &Database, registry: &ClassRegistry) -> Result<MetaData> {
    let mut declared = Vec::new();
    for (class, skeleton) in registry.skeletons() {
        declared.push(declared_table(class, &skeleton.table, skeleton.fields())?);
    }
    for table in registry.tables() {
        declared.push(declared_table(&table.name, &table.name, table.columns.iter().map(|(k, v)| (k.as_str(), v)))?);
    }

    infer_column_types(&mut declared)?;

    let driver = database.driver();
    for table in &mut declared {
        for column in &mut table.columns {
            column.sql_type = column.column_type.sql_name(driver).to_string();
        }
    }

    for table in creation_order(declared.iter().collect()) {
        log::debug!("creating table `{}` if absent", table.name);
        database.create_table(table).await?;
    }

    let mut metadata = MetaData::new();
    let declared_names: Vec<String> = declared.iter().map(|t| t.name.clone()).collect();
    for name in database.table_names().await? {
        if !declared_names.contains(&name) {
            metadata.insert(database.reflect_table(&name).await?);
        }
    }
    for table in declared {
        metadata.insert(table);
    }
    Ok(metadata)
}

/// Builds a table definition from field declarations, primary key first.
fn declared_table<'a>(
    owner: &str,
    name: &str,
    fields: impl Iterator<Item = (&'a str, &'a FieldDecl)>,
) -> Result<TableSchema> {
    let mut columns = Vec::new();
    let mut foreign_keys = Vec::new();

    for (attr, field) in fields {
        let column = field.column_name(attr).to_string();
        if let Some(target) = &field.foreign_key {
            let (target_table, target_column) = parse_foreign_key(target)
                .ok_or_else(|| Error::invalid_declaration(owner, format!("foreign key `{target}` is not `table.column`")))?;
            foreign_keys.push(ForeignKey {
                column: column.clone(),
                target_table: target_table.to_string(),
                target_column: target_column.to_string(),
            });
        }
        columns.push(ColumnSchema {
            name: column,
            column_type: field.column_type.unwrap_or(ColumnType::Untyped),
            sql_type: String::new(),
            primary_key: field.primary_key,
            nullable: field.nullable.unwrap_or(!field.primary_key),
            unique: field.unique,
            index: field.index,
        });
    }

    if columns.is_empty() {
        return Err(Error::invalid_declaration(owner, format!("table `{name}` declares no columns")));
    }
    columns.sort_by_key(|c| !c.primary_key);

    Ok(TableSchema { name: name.to_string(), columns, foreign_keys })
}

/// Gives untyped foreign key columns the type of the column they reference.
fn infer_column_types(tables: &mut [TableSchema]) -> Result<()> {
    let known: BTreeMap<(String, String), ColumnType> = tables
        .iter()
        .flat_map(|t| t.columns.iter().map(|c| ((t.name.clone(), c.name.clone()), c.column_type)))
        .collect();

    for table in tables.iter_mut() {
        for column in table.columns.iter_mut().filter(|c| c.column_type == ColumnType::Untyped) {
            let inferred = table
                .foreign_keys
                .iter()
                .find(|fk| fk.column == column.name)
                .and_then(|fk| known.get(&(fk.target_table.clone(), fk.target_column.clone())))
                .filter(|t| **t != ColumnType::Untyped);
            match inferred {
                Some(column_type) => column.column_type = *column_type,
                None => {
                    return Err(Error::invalid_declaration(
                        &table.name,
                        format!("column `{}` has no type and no typed foreign key", column.name),
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Orders tables so referenced tables come first. Cycles keep declaration order.
fn creation_order(mut pending: Vec<&TableSchema>) -> Vec<&TableSchema> {
    let mut ordered: Vec<&TableSchema> = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let ready = pending.iter().position(|table| {
            table.foreign_keys.iter().all(|fk| {
                fk.target_table == table.name
                    || ordered.iter().any(|t| t.name == fk.target_table)
                    || !pending.iter().any(|t| t.name == fk.target_table)
            })
        });
        ordered.push(pending.remove(ready.unwrap_or(0)));
    }
    ordered
}
