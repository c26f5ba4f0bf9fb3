//! # Mapper Module
//!
//! A [`MappedType`] is a class skeleton resolved against bound metadata: its
//! column attributes, primary key and relationships are final. Mapped types are
//! only created by a binding, so holding one means the schema is ready for
//! persistence.

use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
    Error, Result,
    object::Object,
    resolver,
    schema::TableSchema,
    value::{FieldValue, Fields, Value},
};

// ============================================================================
// Relationships
// ============================================================================

/// How a relationship joins its two tables. All names are column names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipKind {
    /// The source row holds `local`, a foreign key to `remote` on the target.
    ManyToOne { local: String, remote: String },
    /// Target rows hold `remote`, a foreign key to `local` on the source.
    OneToMany { local: String, remote: String },
    /// Rows of `secondary` pair `secondary_local -> source.local` with
    /// `secondary_remote -> target.remote`.
    ManyToMany {
        secondary: String,
        local: String,
        secondary_local: String,
        remote: String,
        secondary_remote: String,
    },
}

impl RelationshipKind {
    pub fn is_collection(&self) -> bool {
        !matches!(self, RelationshipKind::ManyToOne { .. })
    }

    /// The same join seen from the target side.
    pub fn inverse(&self) -> Self {
        match self {
            RelationshipKind::ManyToOne { local, remote } => {
                RelationshipKind::OneToMany { local: remote.clone(), remote: local.clone() }
            }
            RelationshipKind::OneToMany { local, remote } => {
                RelationshipKind::ManyToOne { local: remote.clone(), remote: local.clone() }
            }
            RelationshipKind::ManyToMany { secondary, local, secondary_local, remote, secondary_remote } => {
                RelationshipKind::ManyToMany {
                    secondary: secondary.clone(),
                    local: remote.clone(),
                    secondary_local: secondary_remote.clone(),
                    remote: local.clone(),
                    secondary_remote: secondary_local.clone(),
                }
            }
        }
    }
}

/// A relationship resolved at bind time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipProperty {
    pub name: String,
    /// Class name of the related type.
    pub target: String,
    pub kind: RelationshipKind,
    /// Name of the inverse relationship on the target, if any.
    pub inverse: Option<String>,
}

// ============================================================================
// Mapped Types
// ============================================================================

/// A runtime type bound to one table.
#[derive(Debug)]
pub struct MappedType {
    pub(crate) name: String,
    pub(crate) table: Arc<TableSchema>,
    /// attribute -> column
    pub(crate) attributes: BTreeMap<String, String>,
    /// column -> attribute
    pub(crate) columns: BTreeMap<String, String>,
    pub(crate) relationships: BTreeMap<String, RelationshipProperty>,
    pub(crate) generation: u64,
}

impl MappedType {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &Arc<TableSchema> {
        &self.table
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    /// Generation of the binding this type belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Column attribute names.
    pub fn column_attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    pub fn relationships(&self) -> impl Iterator<Item = &RelationshipProperty> {
        self.relationships.values()
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipProperty> {
        self.relationships.get(name)
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.contains_key(name) || self.relationships.contains_key(name)
    }

    /// The column behind a column attribute.
    pub fn column_for(&self, attribute: &str) -> Option<&str> {
        self.attributes.get(attribute).map(String::as_str)
    }

    /// The attribute exposing a column.
    pub fn attribute_for(&self, column: &str) -> Option<&str> {
        self.columns.get(column).map(String::as_str)
    }

    /// Primary key column names.
    pub fn primary_key(&self) -> Vec<&str> {
        self.table.primary_key()
    }

    /// Constructs a transient object with the given attributes.
    ///
    /// Unknown attributes are rejected before anything is assigned.
    pub fn instantiate(self: &Arc<Self>, fields: Fields) -> Result<Object> {
        let object = Object::transient(Arc::clone(self));
        resolver::update_object(&object, fields)?;
        Ok(object)
    }

    /// Turns attribute equality constraints into column equality constraints.
    pub(crate) fn equality_filter(&self, predicate: &Fields) -> Result<Vec<(String, Value)>> {
        let mut filter = Vec::with_capacity(predicate.len());
        for (attribute, value) in predicate.iter() {
            let column = self.column_for(attribute).ok_or_else(|| Error::unknown_attribute(&self.name, attribute))?;
            match value {
                FieldValue::Scalar(v) => filter.push((column.to_string(), v.clone())),
                _ => {
                    return Err(Error::AttributeType {
                        class: self.name.clone(),
                        attribute: attribute.to_string(),
                        expected: "a scalar value",
                    });
                }
            }
        }
        Ok(filter)
    }
}

impl fmt::Display for MappedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.name, self.table.name)
    }
}

// ============================================================================
// Join Expressions
// ============================================================================

/// One side of a join expression: `qualifier.column` or `qualifier.c.column`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ColumnRef {
    pub qualifier: String,
    pub column: String,
}

/// Parses `A.x == B.y` into its two column references.
pub(crate) fn parse_join(expr: &str) -> Option<(ColumnRef, ColumnRef)> {
    let (left, right) = expr.split_once("==").or_else(|| expr.split_once('='))?;
    Some((parse_column_ref(left)?, parse_column_ref(right)?))
}

fn parse_column_ref(side: &str) -> Option<ColumnRef> {
    let parts: Vec<&str> = side.trim().split('.').map(str::trim).collect();
    let (qualifier, column) = match parts.as_slice() {
        [qualifier, column] => (*qualifier, *column),
        [qualifier, "c", column] => (*qualifier, *column),
        _ => return None,
    };
    if qualifier.is_empty() || column.is_empty() {
        return None;
    }
    Some(ColumnRef { qualifier: qualifier.to_string(), column: column.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(qualifier: &str, column: &str) -> ColumnRef {
        ColumnRef { qualifier: qualifier.into(), column: column.into() }
    }

    #[test]
    fn parses_join_expressions() {
        assert_eq!(
            parse_join("Thing.id==things_association.c.parent_id"),
            Some((col("Thing", "id"), col("things_association", "parent_id")))
        );
        assert_eq!(parse_join(" Address.user_id = users.id "), Some((col("Address", "user_id"), col("users", "id"))));
        assert_eq!(parse_join("Thing.id"), None);
        assert_eq!(parse_join("Thing.id == a.b.c.d"), None);
    }

    #[test]
    fn inverse_swaps_sides() {
        let m2o = RelationshipKind::ManyToOne { local: "user_id".into(), remote: "id".into() };
        assert_eq!(m2o.inverse(), RelationshipKind::OneToMany { local: "id".into(), remote: "user_id".into() });
        assert_eq!(m2o.inverse().inverse(), m2o);

        let m2m = RelationshipKind::ManyToMany {
            secondary: "assoc".into(),
            local: "id".into(),
            secondary_local: "parent_id".into(),
            remote: "id".into(),
            secondary_remote: "child_id".into(),
        };
        match m2m.inverse() {
            RelationshipKind::ManyToMany { secondary_local, secondary_remote, .. } => {
                assert_eq!(secondary_local, "child_id");
                assert_eq!(secondary_remote, "parent_id");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
