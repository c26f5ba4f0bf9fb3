//! # Registry Module
//!
//! The [`ClassRegistry`] collects class skeletons before any database is known
//! and materializes them into [`MappedType`]s once a binding supplies metadata.
//!
//! Relationships name their target by class, so a skeleton may be registered
//! before its target. Targets and join expressions are resolved in
//! [`materialize`](ClassRegistry::materialize), against bound columns.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    sync::Arc,
};

use crate::{
    Error, Result,
    mapper::{ColumnRef, MappedType, RelationshipKind, RelationshipProperty, parse_join},
    schema::{MetaData, TableSchema},
    skeleton::{ClassSkeleton, RelationshipDecl, Skeleton, TableDecl},
};

/// Named class skeletons and plain table declarations.
#[derive(Debug, Clone, Default)]
pub struct ClassRegistry {
    skeletons: BTreeMap<String, ClassSkeleton>,
    tables: BTreeMap<String, TableDecl>,
}

/// A mapped type under construction.
struct Draft {
    table: Arc<TableSchema>,
    attributes: BTreeMap<String, String>,
    relationships: BTreeMap<String, RelationshipProperty>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a skeleton, returning the one it replaced.
    pub fn register(&mut self, name: impl Into<String>, skeleton: ClassSkeleton) -> Option<ClassSkeleton> {
        let name = name.into();
        log::debug!("registering class `{}` for table `{}`", name, skeleton.table);
        self.skeletons.insert(name, skeleton)
    }

    /// Registers the skeleton generated by `#[derive(Skeleton)]`.
    pub fn declare<T: Skeleton>(&mut self) -> Option<ClassSkeleton> {
        self.register(T::class_name(), T::skeleton())
    }

    /// Adds or replaces an unmapped table declaration.
    pub fn declare_table(&mut self, table: TableDecl) -> Option<TableDecl> {
        self.tables.insert(table.name.clone(), table)
    }

    pub fn get(&self, name: &str) -> Option<&ClassSkeleton> {
        self.skeletons.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.skeletons.contains_key(name)
    }

    pub fn skeletons(&self) -> impl Iterator<Item = (&str, &ClassSkeleton)> {
        self.skeletons.iter().map(|(name, skeleton)| (name.as_str(), skeleton))
    }

    pub fn tables(&self) -> impl Iterator<Item = &TableDecl> {
        self.tables.values()
    }

    pub fn len(&self) -> usize {
        self.skeletons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skeletons.is_empty()
    }

    /// Maps each claimed table to its class, failing on the first table
    /// claimed twice. Plain table declarations count as claims.
    pub fn table_owners(&self) -> Result<BTreeMap<&str, &str>> {
        let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
        let claims = self
            .skeletons
            .iter()
            .map(|(name, skeleton)| (skeleton.table.as_str(), name.as_str()))
            .chain(self.tables.keys().map(|table| (table.as_str(), "<table declaration>")));

        for (table, class) in claims {
            match owners.entry(table) {
                Entry::Occupied(existing) => {
                    return Err(Error::DuplicateTable {
                        table: table.to_string(),
                        first: existing.get().to_string(),
                        second: class.to_string(),
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(class);
                }
            }
        }
        Ok(owners)
    }

    /// Builds mapped types for every skeleton from bound metadata.
    pub fn materialize(&self, metadata: &MetaData, generation: u64) -> Result<BTreeMap<String, Arc<MappedType>>> {
        self.table_owners()?;

        let mut drafts = BTreeMap::new();
        for (class, skeleton) in &self.skeletons {
            drafts.insert(class.clone(), self.draft(class, skeleton, metadata)?);
        }

        let mut backrefs = Vec::new();
        for (class, skeleton) in &self.skeletons {
            for (name, decl) in skeleton.relationships() {
                let kind = self.resolve_kind(class, name, decl, &drafts, metadata)?;
                if let Some(backref) = &decl.backref {
                    backrefs.push((class.clone(), name.to_string(), decl.target.clone(), backref.clone(), kind.inverse()));
                }
                let property = RelationshipProperty {
                    name: name.to_string(),
                    target: decl.target.clone(),
                    kind,
                    inverse: decl.backref.clone().or_else(|| decl.back_populates.clone()),
                };
                if let Some(draft) = drafts.get_mut(class) {
                    draft.relationships.insert(name.to_string(), property);
                }
            }
        }

        for (class, name, target, backref, kind) in backrefs {
            let Some(draft) = drafts.get_mut(&target) else {
                return Err(Error::UnknownClass(target));
            };
            if draft.attributes.contains_key(&backref) || draft.relationships.contains_key(&backref) {
                return Err(Error::invalid_declaration(
                    &target,
                    format!("backref `{backref}` of `{class}.{name}` collides with an existing attribute"),
                ));
            }
            draft.relationships.insert(
                backref.clone(),
                RelationshipProperty { name: backref, target: class, kind, inverse: Some(name) },
            );
        }

        self.link_back_populates(&mut drafts)?;

        Ok(drafts
            .into_iter()
            .map(|(name, draft)| {
                let columns = draft.attributes.iter().map(|(attr, col)| (col.clone(), attr.clone())).collect();
                let mapped = MappedType {
                    name: name.clone(),
                    table: draft.table,
                    attributes: draft.attributes,
                    columns,
                    relationships: draft.relationships,
                    generation,
                };
                (name, Arc::new(mapped))
            })
            .collect())
    }

    fn draft(&self, class: &str, skeleton: &ClassSkeleton, metadata: &MetaData) -> Result<Draft> {
        let table = metadata.table(&skeleton.table).cloned().ok_or_else(|| Error::SchemaMismatch {
            class: class.to_string(),
            table: skeleton.table.clone(),
            detail: "table is not part of the bound schema".to_string(),
        })?;

        if table.primary_key().is_empty() {
            return Err(Error::invalid_declaration(class, format!("table `{}` has no primary key", table.name)));
        }

        let mut attributes: BTreeMap<String, String> =
            table.columns.iter().map(|c| (c.name.clone(), c.name.clone())).collect();

        for (attr, field) in skeleton.fields() {
            let column = field.column_name(attr);
            if !table.has_column(column) {
                return Err(Error::SchemaMismatch {
                    class: class.to_string(),
                    table: table.name.clone(),
                    detail: format!("column `{column}` does not exist"),
                });
            }
            if attr != column {
                attributes.remove(column);
                attributes.insert(attr.to_string(), column.to_string());
            }
        }

        for (name, _) in skeleton.relationships() {
            if attributes.contains_key(name) {
                return Err(Error::invalid_declaration(class, format!("relationship `{name}` shadows a column")));
            }
        }

        Ok(Draft { table, attributes, relationships: BTreeMap::new() })
    }

    /// Resolves one side of a join expression to a `(table, column)` pair.
    fn resolve_ref(
        &self,
        column: &ColumnRef,
        drafts: &BTreeMap<String, Draft>,
        metadata: &MetaData,
    ) -> std::result::Result<(String, String), String> {
        let (table, name) = match drafts.get(&column.qualifier) {
            Some(draft) => {
                let name = draft.attributes.get(&column.column).cloned().unwrap_or_else(|| column.column.clone());
                (draft.table.name.clone(), name)
            }
            None if metadata.contains(&column.qualifier) => (column.qualifier.clone(), column.column.clone()),
            None => return Err(format!("`{}` is neither a class nor a table", column.qualifier)),
        };
        match metadata.table(&table) {
            Some(schema) if schema.has_column(&name) => Ok((table, name)),
            _ => Err(format!("column `{table}.{name}` does not exist")),
        }
    }

    /// Parses a join between `side` and `other` and returns `(side column, other column)`.
    fn join_pair(
        &self,
        expr: &str,
        side: &str,
        other: &str,
        drafts: &BTreeMap<String, Draft>,
        metadata: &MetaData,
    ) -> std::result::Result<(String, String), String> {
        let (left, right) = parse_join(expr).ok_or_else(|| format!("cannot parse join `{expr}`"))?;
        let left = self.resolve_ref(&left, drafts, metadata)?;
        let right = self.resolve_ref(&right, drafts, metadata)?;
        if left.0 == side && right.0 == other {
            Ok((left.1, right.1))
        } else if right.0 == side && left.0 == other {
            Ok((right.1, left.1))
        } else {
            Err(format!("join `{expr}` does not connect `{side}` and `{other}`"))
        }
    }

    fn resolve_kind(
        &self,
        class: &str,
        name: &str,
        decl: &RelationshipDecl,
        drafts: &BTreeMap<String, Draft>,
        metadata: &MetaData,
    ) -> Result<RelationshipKind> {
        let invalid = |reason: String| Error::InvalidJoin {
            class: class.to_string(),
            relationship: name.to_string(),
            reason,
        };

        let source = &drafts.get(class).ok_or_else(|| Error::UnknownClass(class.to_string()))?.table;
        let target_draft = drafts.get(&decl.target).ok_or_else(|| Error::UnknownClass(decl.target.clone()))?;
        let target = &target_draft.table;

        if let Some(secondary) = &decl.secondary {
            let assoc = metadata
                .table(secondary)
                .ok_or_else(|| invalid(format!("association table `{secondary}` is not part of the bound schema")))?;

            let (local, secondary_local) = match &decl.primary_join {
                Some(expr) => self.join_pair(expr, &source.name, secondary, drafts, metadata).map_err(invalid)?,
                None => {
                    let fks: Vec<_> = assoc.foreign_keys_to(&source.name).collect();
                    match fks.as_slice() {
                        [fk] => (fk.target_column.clone(), fk.column.clone()),
                        [] => return Err(invalid(format!("`{secondary}` has no foreign key to `{}`", source.name))),
                        _ => return Err(invalid(format!("`{secondary}` has several foreign keys to `{}`; give a primary_join", source.name))),
                    }
                }
            };

            let (remote, secondary_remote) = match &decl.secondary_join {
                Some(expr) => self.join_pair(expr, &target.name, secondary, drafts, metadata).map_err(invalid)?,
                None => {
                    let fks: Vec<_> =
                        assoc.foreign_keys_to(&target.name).filter(|fk| fk.column != secondary_local).collect();
                    match fks.as_slice() {
                        [fk] => (fk.target_column.clone(), fk.column.clone()),
                        [] => return Err(invalid(format!("`{secondary}` has no foreign key to `{}`", target.name))),
                        _ => return Err(invalid(format!("`{secondary}` has several foreign keys to `{}`; give a secondary_join", target.name))),
                    }
                }
            };

            return Ok(RelationshipKind::ManyToMany {
                secondary: secondary.clone(),
                local,
                secondary_local,
                remote,
                secondary_remote,
            });
        }

        let remote_side = decl
            .remote_side
            .as_ref()
            .map(|side| target_draft.attributes.get(side).cloned().unwrap_or_else(|| side.clone()));
        let self_referential = |fk_column: String, referenced: String| {
            if remote_side.as_deref() == Some(referenced.as_str()) {
                RelationshipKind::ManyToOne { local: fk_column, remote: referenced }
            } else {
                RelationshipKind::OneToMany { local: referenced, remote: fk_column }
            }
        };

        if let Some(expr) = &decl.primary_join {
            let (left, right) = parse_join(expr).ok_or_else(|| invalid(format!("cannot parse join `{expr}`")))?;
            let left = self.resolve_ref(&left, drafts, metadata).map_err(invalid)?;
            let right = self.resolve_ref(&right, drafts, metadata).map_err(invalid)?;

            let references = |from: &(String, String), to: &(String, String)| {
                metadata
                    .table(&from.0)
                    .and_then(|t| t.foreign_key_on(&from.1))
                    .is_some_and(|fk| fk.target_table == to.0 && fk.target_column == to.1)
            };
            let (fk_side, referenced) = if references(&left, &right) {
                (left, right)
            } else if references(&right, &left) {
                (right, left)
            } else {
                return Err(invalid(format!("neither side of `{expr}` is a foreign key to the other")));
            };

            if source.name == target.name {
                return Ok(self_referential(fk_side.1, referenced.1));
            }
            return if fk_side.0 == source.name && referenced.0 == target.name {
                Ok(RelationshipKind::ManyToOne { local: fk_side.1, remote: referenced.1 })
            } else if fk_side.0 == target.name && referenced.0 == source.name {
                Ok(RelationshipKind::OneToMany { local: referenced.1, remote: fk_side.1 })
            } else {
                Err(invalid(format!("join `{expr}` does not connect `{}` and `{}`", source.name, target.name)))
            };
        }

        if source.name == target.name {
            let fks: Vec<_> = source.foreign_keys_to(&source.name).collect();
            return match fks.as_slice() {
                [fk] => Ok(self_referential(fk.column.clone(), fk.target_column.clone())),
                [] => Err(invalid(format!("`{}` has no foreign key to itself", source.name))),
                _ => Err(invalid(format!("`{}` has several foreign keys to itself; give a primary_join", source.name))),
            };
        }

        let outgoing: Vec<_> = source.foreign_keys_to(&target.name).collect();
        let incoming: Vec<_> = target.foreign_keys_to(&source.name).collect();
        match (outgoing.as_slice(), incoming.as_slice()) {
            ([fk], []) => Ok(RelationshipKind::ManyToOne { local: fk.column.clone(), remote: fk.target_column.clone() }),
            ([], [fk]) => Ok(RelationshipKind::OneToMany { local: fk.target_column.clone(), remote: fk.column.clone() }),
            ([], []) => Err(invalid(format!("no foreign key links `{}` and `{}`", source.name, target.name))),
            _ => Err(invalid(format!(
                "several foreign keys link `{}` and `{}`; give a primary_join",
                source.name, target.name
            ))),
        }
    }

    /// Validates `back_populates` pairs and points each side at the other.
    fn link_back_populates(&self, drafts: &mut BTreeMap<String, Draft>) -> Result<()> {
        let mut links = Vec::new();
        for (class, skeleton) in &self.skeletons {
            for (name, decl) in skeleton.relationships() {
                let Some(inverse) = &decl.back_populates else { continue };
                let Some(property) = drafts.get(class).and_then(|draft| draft.relationships.get(name)) else {
                    continue;
                };
                let linked = drafts
                    .get(&decl.target)
                    .and_then(|draft| draft.relationships.get(inverse))
                    .is_some_and(|other| other.target == *class && other.kind == property.kind.inverse());
                if !linked {
                    return Err(Error::InvalidJoin {
                        class: class.clone(),
                        relationship: name.to_string(),
                        reason: format!("`{}.{inverse}` is not a relationship back to `{class}`", decl.target),
                    });
                }
                links.push((decl.target.clone(), inverse.clone(), name.to_string()));
            }
        }

        for (target, inverse, name) in links {
            if let Some(other) = drafts.get_mut(&target).and_then(|draft| draft.relationships.get_mut(&inverse)) {
                other.inverse.get_or_insert(name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnSchema, ColumnType, ForeignKey};

    fn column(name: &str, primary_key: bool) -> ColumnSchema {
        ColumnSchema {
            name: name.into(),
            column_type: ColumnType::Integer,
            sql_type: "INTEGER".into(),
            primary_key,
            nullable: !primary_key,
            unique: false,
            index: false,
        }
    }

    fn fk(column: &str, table: &str) -> ForeignKey {
        ForeignKey { column: column.into(), target_table: table.into(), target_column: "id".into() }
    }

    fn metadata() -> MetaData {
        let mut metadata = MetaData::new();
        metadata.insert(TableSchema { name: "users".into(), columns: vec![column("id", true)], foreign_keys: vec![] });
        metadata.insert(TableSchema {
            name: "addresses".into(),
            columns: vec![column("id", true), column("user_id", false)],
            foreign_keys: vec![fk("user_id", "users")],
        });
        metadata.insert(TableSchema {
            name: "nodes".into(),
            columns: vec![column("id", true), column("parent_id", false)],
            foreign_keys: vec![fk("parent_id", "nodes")],
        });
        metadata
    }

    #[test]
    fn infers_direction_from_foreign_keys() {
        let mut registry = ClassRegistry::new();
        registry.register("User", ClassSkeleton::new("users").relationship("addresses", RelationshipDecl::new("Address")));
        registry.register("Address", ClassSkeleton::new("addresses").relationship("user", RelationshipDecl::new("User")));

        let mapped = registry.materialize(&metadata(), 1).unwrap();
        assert_eq!(
            mapped["User"].relationship("addresses").unwrap().kind,
            RelationshipKind::OneToMany { local: "id".into(), remote: "user_id".into() }
        );
        assert_eq!(
            mapped["Address"].relationship("user").unwrap().kind,
            RelationshipKind::ManyToOne { local: "user_id".into(), remote: "id".into() }
        );
    }

    #[test]
    fn self_reference_uses_remote_side() {
        let mut registry = ClassRegistry::new();
        registry.register(
            "Node",
            ClassSkeleton::new("nodes")
                .relationship("children", RelationshipDecl::new("Node"))
                .relationship("parent", RelationshipDecl::new("Node").remote_side("id")),
        );
        let mapped = registry.materialize(&metadata(), 1).unwrap();
        assert!(mapped["Node"].relationship("children").unwrap().kind.is_collection());
        assert!(!mapped["Node"].relationship("parent").unwrap().kind.is_collection());
    }

    #[test]
    fn backref_creates_inverse() {
        let mut registry = ClassRegistry::new();
        registry.register("User", ClassSkeleton::new("users"));
        registry.register(
            "Address",
            ClassSkeleton::new("addresses").relationship("user", RelationshipDecl::new("User").backref("addresses")),
        );
        let mapped = registry.materialize(&metadata(), 1).unwrap();
        let inverse = mapped["User"].relationship("addresses").unwrap();
        assert_eq!(inverse.target, "Address");
        assert_eq!(inverse.inverse.as_deref(), Some("user"));
    }

    #[test]
    fn rejects_duplicate_tables_and_unknown_targets() {
        let mut registry = ClassRegistry::new();
        registry.register("A", ClassSkeleton::new("users"));
        registry.register("B", ClassSkeleton::new("users"));
        assert!(matches!(registry.materialize(&metadata(), 1), Err(Error::DuplicateTable { .. })));

        let mut registry = ClassRegistry::new();
        registry.register("User", ClassSkeleton::new("users").relationship("pets", RelationshipDecl::new("Pet")));
        assert!(matches!(registry.materialize(&metadata(), 1), Err(Error::UnknownClass(name)) if name == "Pet"));
    }
}
