//! # Skeleton Module
//!
//! Caller-side declarations of future mapped types. A [`ClassSkeleton`] names a
//! table and maps attribute names to either a column ([`FieldDecl`]) or a
//! relationship ([`RelationshipDecl`]). Skeletons never touch a database; they
//! are resolved against live metadata when the ORM is bound.
//!
//! Skeletons can be built in code, parsed from JSON with [`Declarations`], or
//! generated from a struct with `#[derive(Skeleton)]`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{Result, schema::ColumnType};

// ============================================================================
// Field Declarations
// ============================================================================

/// Declares a column.
///
/// In deferred mode every property left unset is taken from the reflected
/// table; in eager mode the declaration is the table definition.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldDecl {
    /// Column name, defaulting to the attribute name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub column_type: Option<ColumnType>,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    /// Referenced column as `table.column`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreign_key: Option<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub index: bool,
}

impl FieldDecl {
    pub fn new(column_type: ColumnType) -> Self {
        Self { column_type: Some(column_type), ..Self::default() }
    }

    /// A column whose type is inferred (from reflection or from its foreign key).
    pub fn untyped() -> Self {
        Self::default()
    }

    pub fn column(mut self, name: impl Into<String>) -> Self {
        self.column = Some(name.into());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    pub fn not_null(self) -> Self {
        self.nullable(false)
    }

    pub fn foreign_key(mut self, target: impl Into<String>) -> Self {
        self.foreign_key = Some(target.into());
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    /// The column this field maps to.
    pub(crate) fn column_name<'a>(&'a self, attribute: &'a str) -> &'a str {
        self.column.as_deref().unwrap_or(attribute)
    }
}

// ============================================================================
// Relationship Declarations
// ============================================================================

/// Declares a relationship to another skeleton, referenced by class name.
///
/// Join expressions take the form `Class.attribute == table.c.column` (the
/// `.c` is optional) and are only evaluated at bind time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RelationshipDecl {
    pub target: String,
    /// Association table for many-to-many relationships.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_join: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_join: Option<String>,
    /// Name of an inverse relationship to synthesize on the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backref: Option<String>,
    /// Name of an inverse relationship declared on the target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub back_populates: Option<String>,
    /// Referenced column of a self-referential many-to-one relationship.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_side: Option<String>,
}

impl RelationshipDecl {
    pub fn new(target: impl Into<String>) -> Self {
        Self { target: target.into(), ..Self::default() }
    }

    pub fn secondary(mut self, table: impl Into<String>) -> Self {
        self.secondary = Some(table.into());
        self
    }

    pub fn primary_join(mut self, expr: impl Into<String>) -> Self {
        self.primary_join = Some(expr.into());
        self
    }

    pub fn secondary_join(mut self, expr: impl Into<String>) -> Self {
        self.secondary_join = Some(expr.into());
        self
    }

    pub fn backref(mut self, name: impl Into<String>) -> Self {
        self.backref = Some(name.into());
        self
    }

    pub fn back_populates(mut self, name: impl Into<String>) -> Self {
        self.back_populates = Some(name.into());
        self
    }

    pub fn remote_side(mut self, column: impl Into<String>) -> Self {
        self.remote_side = Some(column.into());
        self
    }
}

// ============================================================================
// Class Skeletons
// ============================================================================

/// A single declared attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Attribute {
    Field(FieldDecl),
    Relationship(RelationshipDecl),
}

/// The declared shape of a future mapped type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSkeleton {
    pub table: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Attribute>,
}

impl ClassSkeleton {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into(), attributes: BTreeMap::new() }
    }

    pub fn field(mut self, name: impl Into<String>, field: FieldDecl) -> Self {
        self.attributes.insert(name.into(), Attribute::Field(field));
        self
    }

    pub fn relationship(mut self, name: impl Into<String>, relationship: RelationshipDecl) -> Self {
        self.attributes.insert(name.into(), Attribute::Relationship(relationship));
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldDecl)> {
        self.attributes.iter().filter_map(|(name, attr)| match attr {
            Attribute::Field(f) => Some((name.as_str(), f)),
            Attribute::Relationship(_) => None,
        })
    }

    pub fn relationships(&self) -> impl Iterator<Item = (&str, &RelationshipDecl)> {
        self.attributes.iter().filter_map(|(name, attr)| match attr {
            Attribute::Relationship(r) => Some((name.as_str(), r)),
            Attribute::Field(_) => None,
        })
    }
}

/// Implemented by `#[derive(Skeleton)]`.
///
/// ```rust,ignore
/// #[derive(Skeleton)]
/// #[orm(table = "users")]
/// struct User {
///     #[orm(relationship = "Address")]
///     addresses: Vec<Object>,
/// }
///
/// orm.declare::<User>();
/// ```
pub trait Skeleton {
    /// The class name the skeleton registers under.
    fn class_name() -> &'static str;

    /// The declared skeleton.
    fn skeleton() -> ClassSkeleton;
}

// ============================================================================
// Plain Tables
// ============================================================================

/// An unmapped table, typically an association table, created in eager mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDecl {
    pub name: String,
    #[serde(default)]
    pub columns: BTreeMap<String, FieldDecl>,
}

impl TableDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), columns: BTreeMap::new() }
    }

    pub fn column(mut self, name: impl Into<String>, field: FieldDecl) -> Self {
        self.columns.insert(name.into(), field);
        self
    }
}

// ============================================================================
// Declaration Sets
// ============================================================================

/// A set of named skeletons, as read from a declaration document.
///
/// ```json
/// {
///   "User": {
///     "table": "users",
///     "attributes": {
///       "addresses": { "kind": "relationship", "target": "Address" }
///     }
///   }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Declarations(pub BTreeMap<String, ClassSkeleton>);

impl Declarations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_reader(reader: impl std::io::Read) -> Result<Self> {
        Ok(serde_json::from_reader(reader)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn class(mut self, name: impl Into<String>, skeleton: ClassSkeleton) -> Self {
        self.0.insert(name.into(), skeleton);
        self
    }
}

impl IntoIterator for Declarations {
    type Item = (String, ClassSkeleton);
    type IntoIter = std::collections::btree_map::IntoIter<String, ClassSkeleton>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Splits a `table.column` foreign key target.
pub(crate) fn parse_foreign_key(target: &str) -> Option<(&str, &str)> {
    let (table, column) = target.rsplit_once('.')?;
    if table.is_empty() || column.is_empty() {
        return None;
    }
    Some((table, column))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_foreign_key_targets() {
        assert_eq!(parse_foreign_key("users.id"), Some(("users", "id")));
        assert_eq!(parse_foreign_key("main.users.id"), Some(("main.users", "id")));
        assert_eq!(parse_foreign_key("users"), None);
        assert_eq!(parse_foreign_key("users."), None);
    }

    #[test]
    fn declarations_read_tagged_attributes() {
        let decls = Declarations::from_json(
            r#"{
                "Address": {
                    "table": "addresses",
                    "attributes": {
                        "user_id": { "kind": "field", "foreign_key": "users.id" },
                        "user": { "kind": "relationship", "target": "User" }
                    }
                }
            }"#,
        )
        .unwrap();
        let address = &decls.0["Address"];
        assert_eq!(address.table, "addresses");
        assert_eq!(address.fields().count(), 1);
        let (name, rel) = address.relationships().next().unwrap();
        assert_eq!(name, "user");
        assert_eq!(rel.target, "User");
    }
}
