//! # Session Module
//!
//! Unit-of-work scopes over one binding.
//!
//! A [`Session`] tracks pending, modified and deleted objects and writes them
//! in a single transaction, begun lazily on first use. The identity map keeps
//! one [`Object`] per row for the life of the session.
//!
//! ## Flush order
//!
//! 1. Objects reachable from the session are cascaded into it.
//! 2. Foreign keys are assigned from recorded relationship changes.
//! 3. New rows are inserted, referenced rows first. A dependency cycle falls
//!    back to inserting with a `NULL` key and updating it afterwards.
//! 4. Modified rows are updated, association rows written.
//! 5. Deleted rows are removed, after unlinking their children.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use sqlx::any::{AnyQueryResult, AnyRow};

use crate::{
    Error, Result,
    binder::Binding,
    database::{Connection, Drivers},
    mapper::{MappedType, RelationshipKind, RelationshipProperty},
    object::{self, Change, Object, ObjectState, RelationState},
    transaction::Transaction,
    value::{Fields, Value, arguments, decode_column},
};

// ============================================================================
// Options & Factory
// ============================================================================

/// Behavior switches for new sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Flush pending work before every query.
    pub autoflush: bool,
    /// Forget loaded relationships after each commit.
    pub expire_on_commit: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { autoflush: true, expire_on_commit: true }
    }
}

impl SessionOptions {
    pub fn autoflush(mut self, autoflush: bool) -> Self {
        self.autoflush = autoflush;
        self
    }

    pub fn expire_on_commit(mut self, expire: bool) -> Self {
        self.expire_on_commit = expire;
        self
    }
}

/// Produces sessions bound to one binding.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    binding: Arc<Binding>,
    current: Arc<AtomicU64>,
    options: SessionOptions,
}

impl SessionFactory {
    pub(crate) fn new(binding: Arc<Binding>, current: Arc<AtomicU64>, options: SessionOptions) -> Self {
        Self { binding, current, options }
    }

    pub fn binding(&self) -> &Arc<Binding> {
        &self.binding
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    pub fn new_session(&self) -> Session {
        log::debug!("opening session on binding generation {}", self.binding.generation);
        Session {
            binding: Arc::clone(&self.binding),
            current: Arc::clone(&self.current),
            options: self.options,
            tx: None,
            identity_map: HashMap::new(),
            new: Vec::new(),
            deleted: Vec::new(),
            inserted: Vec::new(),
            removed: Vec::new(),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

type IdentityKey = (String, Vec<String>);

fn identity_key(mapped: &MappedType, identity: &[Value]) -> IdentityKey {
    (mapped.table_name().to_string(), identity.iter().map(Value::key_repr).collect())
}

/// A foreign key assignment derived from a relationship change.
struct Link {
    child: Object,
    child_column: String,
    parent_column: String,
    parent: Option<Object>,
}

/// A unit of work.
#[derive(Debug)]
pub struct Session {
    binding: Arc<Binding>,
    current: Arc<AtomicU64>,
    options: SessionOptions,
    tx: Option<Transaction>,
    identity_map: HashMap<IdentityKey, Object>,
    new: Vec<Object>,
    deleted: Vec<Object>,
    /// Rows inserted by flushes of the open transaction.
    inserted: Vec<Object>,
    /// Rows deleted by flushes of the open transaction.
    removed: Vec<Object>,
}

impl Session {
    pub fn binding(&self) -> &Arc<Binding> {
        &self.binding
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// True while a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    /// True when the object is pending in or attached to this session.
    pub fn contains(&self, object: &Object) -> bool {
        if self.new.contains(object) {
            return true;
        }
        match object.identity() {
            Some(identity) => self.identity_map.get(&identity_key(object.mapped_type(), &identity)) == Some(object),
            None => false,
        }
    }

    /// Objects added but not yet flushed.
    pub fn pending(&self) -> &[Object] {
        &self.new
    }

    fn driver(&self) -> Drivers {
        self.binding.database.driver()
    }

    // ------------------------------------------------------------------------
    // Binding checks
    // ------------------------------------------------------------------------

    pub(crate) fn check_binding(&self) -> Result<()> {
        let current = self.current.load(Ordering::SeqCst);
        if current != self.binding.generation {
            return Err(Error::StaleBinding { expected: self.binding.generation, current });
        }
        Ok(())
    }

    pub(crate) fn check_type(&self, mapped: &MappedType) -> Result<()> {
        self.check_binding()?;
        if mapped.generation() != self.binding.generation {
            return Err(Error::StaleBinding { expected: mapped.generation(), current: self.binding.generation });
        }
        Ok(())
    }

    pub(crate) fn check_object(&self, object: &Object) -> Result<()> {
        self.check_type(object.mapped_type())
    }

    // ------------------------------------------------------------------------
    // Tracking
    // ------------------------------------------------------------------------

    /// Adds an object, and everything reachable from it, to the session.
    pub fn add(&mut self, object: &Object) -> Result<()> {
        self.check_object(object)?;
        self.deleted.retain(|o| o != object);
        self.cascade(vec![object.clone()])
    }

    pub fn add_all<'a>(&mut self, objects: impl IntoIterator<Item = &'a Object>) -> Result<()> {
        for object in objects {
            self.add(object)?;
        }
        Ok(())
    }

    fn cascade(&mut self, roots: Vec<Object>) -> Result<()> {
        let objects = object::reachable(roots);
        for object in &objects {
            self.check_object(object)?;
        }

        for object in objects {
            let (state, identity) = {
                let data = object.lock();
                (data.state, data.identity.clone())
            };
            match state {
                ObjectState::Transient => {
                    log::debug!("cascading new {} into session", object.class_name());
                    object.lock().state = ObjectState::Pending;
                    self.new.push(object);
                }
                ObjectState::Pending if !self.new.contains(&object) => self.new.push(object),
                ObjectState::Persistent => {
                    if let Some(identity) = identity {
                        let key = identity_key(object.mapped_type(), &identity);
                        self.identity_map.entry(key).or_insert(object);
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Marks an object for deletion at the next flush.
    ///
    /// A pending object is simply dropped from the session.
    pub fn delete(&mut self, object: &Object) -> Result<()> {
        self.check_object(object)?;
        match object.state() {
            ObjectState::Pending => {
                self.new.retain(|o| o != object);
                object.lock().state = ObjectState::Transient;
            }
            ObjectState::Persistent => {
                self.cascade(vec![object.clone()])?;
                if !self.deleted.contains(object) {
                    self.deleted.push(object.clone());
                }
            }
            state => log::debug!("ignoring delete of {:?} {}", state, object.class_name()),
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // SQL plumbing
    // ------------------------------------------------------------------------

    async fn connection(&mut self) -> Result<&mut Transaction> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => {
                log::debug!("beginning transaction");
                self.binding.database.begin().await?
            }
        };
        Ok(self.tx.insert(tx))
    }

    async fn execute(&mut self, sql: &str, values: &[Value]) -> Result<AnyQueryResult> {
        log::debug!("{}", sql);
        let args = arguments(values)?;
        Ok(self.connection().await?.execute(sql, args).await?)
    }

    async fn fetch_all(&mut self, sql: &str, values: &[Value]) -> Result<Vec<AnyRow>> {
        log::debug!("{}", sql);
        let args = arguments(values)?;
        Ok(self.connection().await?.fetch_all(sql, args).await?)
    }

    async fn fetch_one(&mut self, sql: &str, values: &[Value]) -> Result<AnyRow> {
        log::debug!("{}", sql);
        let args = arguments(values)?;
        Ok(self.connection().await?.fetch_one(sql, args).await?)
    }

    async fn fetch_optional(&mut self, sql: &str, values: &[Value]) -> Result<Option<AnyRow>> {
        log::debug!("{}", sql);
        let args = arguments(values)?;
        Ok(self.connection().await?.fetch_optional(sql, args).await?)
    }

    fn select_list(&self, mapped: &MappedType, qualifier: Option<&str>) -> String {
        let driver = self.driver();
        mapped
            .table()
            .columns
            .iter()
            .map(|c| match qualifier {
                Some(q) => format!("{}.{}", q, driver.quote(&c.name)),
                None => driver.quote(&c.name),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Renders `column = value` constraints, binding non-null values.
    fn conditions(&self, filter: &[(String, Value)], qualifier: Option<&str>, values: &mut Vec<Value>) -> Vec<String> {
        let driver = self.driver();
        filter
            .iter()
            .map(|(column, value)| {
                let column = match qualifier {
                    Some(q) => format!("{}.{}", q, driver.quote(column)),
                    None => driver.quote(column),
                };
                if value.is_null() {
                    format!("{column} IS NULL")
                } else {
                    values.push(value.clone());
                    format!("{column} = {}", driver.placeholder(values.len()))
                }
            })
            .collect()
    }

    fn where_clause(&self, filter: &[(String, Value)], qualifier: Option<&str>, values: &mut Vec<Value>) -> String {
        let conditions = self.conditions(filter, qualifier, values);
        if conditions.is_empty() { String::new() } else { format!(" WHERE {}", conditions.join(" AND ")) }
    }

    fn decode_row(mapped: &MappedType, row: &AnyRow) -> Result<BTreeMap<String, Value>> {
        let mut values = BTreeMap::new();
        for (index, column) in mapped.table().columns.iter().enumerate() {
            values.insert(column.name.clone(), decode_column(row, index)?.coerce(column.column_type));
        }
        Ok(values)
    }

    fn identity_of(mapped: &MappedType, values: &BTreeMap<String, Value>) -> Vec<Value> {
        mapped.primary_key().iter().map(|c| values.get(*c).cloned().unwrap_or(Value::Null)).collect()
    }

    /// Returns the identity-mapped object for a row, creating it on first sight.
    fn hydrate(&mut self, mapped: &Arc<MappedType>, row: &AnyRow) -> Result<Object> {
        let values = Self::decode_row(mapped, row)?;
        let identity = Self::identity_of(mapped, &values);
        let key = identity_key(mapped, &identity);
        if let Some(existing) = self.identity_map.get(&key) {
            return Ok(existing.clone());
        }
        let object = Object::persistent(Arc::clone(mapped), values, identity);
        self.identity_map.insert(key, object.clone());
        Ok(object)
    }

    pub(crate) async fn select(&mut self, mapped: &Arc<MappedType>, filter: &[(String, Value)]) -> Result<Vec<Object>> {
        let mut values = Vec::new();
        let sql = format!(
            "SELECT {} FROM {}{}",
            self.select_list(mapped, None),
            self.driver().quote(mapped.table_name()),
            self.where_clause(filter, None, &mut values)
        );
        let rows = self.fetch_all(&sql, &values).await?;
        rows.iter().map(|row| self.hydrate(mapped, row)).collect()
    }

    pub(crate) async fn count_filter(&mut self, mapped: &MappedType, filter: &[(String, Value)]) -> Result<i64> {
        let mut values = Vec::new();
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            self.driver().quote(mapped.table_name()),
            self.where_clause(filter, None, &mut values)
        );
        let row = self.fetch_one(&sql, &values).await?;
        Ok(decode_column(&row, 0)?.as_i64().unwrap_or(0))
    }

    async fn autoflush(&mut self) -> Result<()> {
        if self.options.autoflush { self.flush().await } else { Ok(()) }
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Loads an object by its single-column primary key.
    pub async fn get(&mut self, mapped: &Arc<MappedType>, key: impl Into<Value>) -> Result<Option<Object>> {
        self.get_by_identity(mapped, vec![key.into()]).await
    }

    /// Loads an object by primary key values, consulting the identity map first.
    pub async fn get_by_identity(&mut self, mapped: &Arc<MappedType>, identity: Vec<Value>) -> Result<Option<Object>> {
        self.check_type(mapped)?;
        let primary_key = mapped.primary_key();
        if primary_key.len() != identity.len() {
            return Err(Error::AttributeType {
                class: mapped.name().to_string(),
                attribute: primary_key.join(", "),
                expected: "one value per primary key column",
            });
        }

        if let Some(object) = self.identity_map.get(&identity_key(mapped, &identity)) {
            let gone = object.state() == ObjectState::Deleted || self.deleted.contains(object);
            return Ok(if gone { None } else { Some(object.clone()) });
        }

        let filter: Vec<(String, Value)> = primary_key.iter().map(|c| c.to_string()).zip(identity).collect();
        self.autoflush().await?;
        Ok(self.select(mapped, &filter).await?.into_iter().next())
    }

    /// Objects whose column attributes equal `predicate`.
    pub async fn find(&mut self, mapped: &Arc<MappedType>, predicate: &Fields) -> Result<Vec<Object>> {
        self.check_type(mapped)?;
        let filter = mapped.equality_filter(predicate)?;
        self.autoflush().await?;
        self.select(mapped, &filter).await
    }

    pub async fn all(&mut self, mapped: &Arc<MappedType>) -> Result<Vec<Object>> {
        self.find(mapped, &Fields::new()).await
    }

    /// Counts rows whose column attributes equal `predicate`.
    pub async fn count(&mut self, mapped: &Arc<MappedType>, predicate: &Fields) -> Result<i64> {
        self.check_type(mapped)?;
        let filter = mapped.equality_filter(predicate)?;
        self.autoflush().await?;
        self.count_filter(mapped, &filter).await
    }

    /// The contents of a relationship, loading it from storage if needed.
    ///
    /// A many-to-one relationship yields zero or one object.
    pub async fn related(&mut self, object: &Object, relationship: &str) -> Result<Vec<Object>> {
        self.check_object(object)?;
        if let Some(loaded) = object.related(relationship)? {
            return Ok(loaded);
        }
        self.autoflush().await?;

        let property = object
            .mapped_type()
            .relationship(relationship)
            .cloned()
            .ok_or_else(|| Error::unknown_attribute(object.class_name(), relationship))?;
        let target = Arc::clone(self.binding.mapped(&property.target)?);
        let loaded = self.load_relationship(object, &property, &target).await?;

        let mut data = object.lock();
        let result = if property.kind.is_collection() {
            let mut items = loaded;
            if let RelationState::Appended(appended) = data.relation(relationship) {
                for item in appended {
                    if !items.contains(item) {
                        items.push(item.clone());
                    }
                }
            }
            for change in &data.changes {
                match change {
                    Change::Add { relationship: r, target } if r == relationship && !items.contains(target) => {
                        items.push(target.clone());
                    }
                    Change::Remove { relationship: r, target } if r == relationship => items.retain(|i| i != target),
                    _ => {}
                }
            }
            data.relations.insert(relationship.to_string(), RelationState::Many(items.clone()));
            items
        } else {
            data.relations.insert(relationship.to_string(), RelationState::One(loaded.first().cloned()));
            loaded.into_iter().take(1).collect()
        };
        Ok(result)
    }

    async fn load_relationship(
        &mut self,
        object: &Object,
        property: &RelationshipProperty,
        target: &Arc<MappedType>,
    ) -> Result<Vec<Object>> {
        let column_value = |column: &str| object.lock().values.get(column).cloned().unwrap_or(Value::Null);

        match &property.kind {
            RelationshipKind::ManyToOne { local, remote } => {
                let value = column_value(local);
                if value.is_null() {
                    return Ok(Vec::new());
                }
                if target.primary_key() == [remote.as_str()] {
                    let key = identity_key(target, std::slice::from_ref(&value));
                    if let Some(hit) = self.identity_map.get(&key) {
                        return Ok(vec![hit.clone()]);
                    }
                }
                self.select(target, &[(remote.clone(), value)]).await
            }
            RelationshipKind::OneToMany { local, remote } => {
                let value = column_value(local);
                if value.is_null() {
                    return Ok(Vec::new());
                }
                self.select(target, &[(remote.clone(), value)]).await
            }
            RelationshipKind::ManyToMany { secondary, local, secondary_local, remote, secondary_remote } => {
                let value = column_value(local);
                if value.is_null() {
                    return Ok(Vec::new());
                }
                let driver = self.driver();
                let mut values = Vec::new();
                let sql = format!(
                    "SELECT {} FROM {} t JOIN {} s ON s.{} = t.{}{}",
                    self.select_list(target, Some("t")),
                    driver.quote(target.table_name()),
                    driver.quote(secondary),
                    driver.quote(secondary_remote),
                    driver.quote(remote),
                    self.where_clause(&[(secondary_local.clone(), value)], Some("s"), &mut values)
                );
                let rows = self.fetch_all(&sql, &values).await?;
                rows.iter().map(|row| self.hydrate(target, row)).collect()
            }
        }
    }

    /// Reloads an object's columns from its row, discarding unflushed changes.
    pub async fn refresh(&mut self, object: &Object) -> Result<()> {
        self.check_object(object)?;
        let identity = object.identity().ok_or_else(|| Error::MissingIdentity { class: object.class_name().to_string() })?;
        if !self.reload(object, &identity).await? {
            return Err(Error::Database(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    async fn reload(&mut self, object: &Object, identity: &[Value]) -> Result<bool> {
        let mapped = Arc::clone(object.mapped_type());
        let filter: Vec<(String, Value)> =
            mapped.primary_key().iter().map(|c| c.to_string()).zip(identity.iter().cloned()).collect();
        let mut values = Vec::new();
        let sql = format!(
            "SELECT {} FROM {}{}",
            self.select_list(&mapped, None),
            self.driver().quote(mapped.table_name()),
            self.where_clause(&filter, None, &mut values)
        );
        let Some(row) = self.fetch_optional(&sql, &values).await? else {
            return Ok(false);
        };
        let decoded = Self::decode_row(&mapped, &row)?;

        let mut data = object.lock();
        data.values = decoded;
        data.modified.clear();
        data.changes.clear();
        data.relations.clear();
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------------

    /// Writes all pending work to the open transaction.
    pub async fn flush(&mut self) -> Result<()> {
        self.check_binding()?;

        let roots: Vec<Object> = self.new.iter().chain(self.identity_map.values()).cloned().collect();
        self.cascade(roots)?;

        let pending = std::mem::take(&mut self.new);
        let mut objects = pending.clone();
        objects.extend(self.identity_map.values().cloned());

        if pending.is_empty() && self.deleted.is_empty() && !objects.iter().any(Object::is_modified) {
            return Ok(());
        }
        log::debug!(
            "flushing {} new, {} deleted and {} tracked object(s)",
            pending.len(),
            self.deleted.len(),
            objects.len() - pending.len()
        );

        let result = self.flush_objects(&pending, &objects).await;
        if result.is_err() {
            self.new = pending.into_iter().filter(|o| o.state() == ObjectState::Pending).collect();
        }
        result
    }

    async fn flush_objects(&mut self, pending: &[Object], objects: &[Object]) -> Result<()> {
        let mut unlinks = Vec::new();
        let mut links = Vec::new();
        let mut associations = Vec::new();

        // changes stay recorded until their statements succeed, so a failed
        // flush can be retried
        for object in objects {
            let changes = object.lock().changes.clone();
            let mapped = Arc::clone(object.mapped_type());
            for change in changes {
                let (name, target, adding) = match change {
                    Change::Set { relationship, target } => (relationship, target, true),
                    Change::Add { relationship, target } => (relationship, Some(target), true),
                    Change::Remove { relationship, target } => (relationship, Some(target), false),
                };
                let Some(property) = mapped.relationship(&name) else { continue };
                match (&property.kind, target) {
                    (RelationshipKind::ManyToOne { local, remote }, parent) => links.push(Link {
                        child: object.clone(),
                        child_column: local.clone(),
                        parent_column: remote.clone(),
                        parent,
                    }),
                    (RelationshipKind::OneToMany { local, remote }, Some(child)) => {
                        let link = Link {
                            child,
                            child_column: remote.clone(),
                            parent_column: local.clone(),
                            parent: Some(object.clone()),
                        };
                        if adding { links.push(link) } else { unlinks.push(link) }
                    }
                    (RelationshipKind::ManyToMany { .. }, Some(target)) => {
                        associations.push((property.clone(), name, object.clone(), target, adding));
                    }
                    _ => {}
                }
            }
        }

        // Only unlink children still pointing at the parent that let them go.
        for link in &unlinks {
            let Some(parent) = &link.parent else { continue };
            let parent_value = parent.lock().values.get(&link.parent_column).cloned().unwrap_or(Value::Null);
            let child_value = link.child.lock().values.get(&link.child_column).cloned().unwrap_or(Value::Null);
            if !parent_value.is_null() && parent_value == child_value {
                link.child.write_column(&link.child_column, Value::Null);
            }
        }

        let mut deferred = Vec::new();
        for link in links.iter() {
            if !apply_link(link) {
                deferred.push(link);
            }
        }

        for object in insert_order(pending, &links) {
            self.insert(&object).await?;
            self.inserted.push(object.clone());
            let (ready, rest): (Vec<&Link>, Vec<&Link>) =
                deferred.into_iter().partition(|link| link.parent.as_ref() == Some(&object));
            deferred = rest;
            for link in ready {
                apply_link(link);
            }
        }

        let dirty: Vec<Object> = self
            .identity_map
            .values()
            .filter(|o| !o.lock().modified.is_empty() && !self.deleted.contains(o))
            .cloned()
            .collect();
        for object in dirty {
            self.update(&object).await?;
        }

        for (property, name, source, target, adding) in associations {
            self.write_association(&property, &source, &target, adding).await?;
            let mut data = source.lock();
            let written = data
                .changes
                .iter()
                .position(|c| if adding { c.is_add(&name, &target) } else { c.is_remove(&name, &target) });
            if let Some(index) = written {
                data.changes.remove(index);
            }
        }

        while let Some(object) = self.deleted.first().cloned() {
            self.delete_row(&object).await?;
            self.deleted.remove(0);
            self.removed.push(object);
        }

        for object in objects {
            object.lock().changes.clear();
        }
        Ok(())
    }

    async fn insert(&mut self, object: &Object) -> Result<()> {
        let mapped = Arc::clone(object.mapped_type());
        let table = Arc::clone(mapped.table());
        let driver = self.driver();
        let primary_key = table.primary_key();
        let generated = table.has_generated_key();

        let columns: Vec<(String, Value)> = {
            let data = object.lock();
            table
                .columns
                .iter()
                .filter_map(|c| data.values.get(&c.name).map(|v| (c.name.clone(), v.clone())))
                .filter(|(c, v)| !(generated && v.is_null() && primary_key.contains(&c.as_str())))
                .collect()
        };
        let needs_key = generated && !columns.iter().any(|(c, _)| primary_key.contains(&c.as_str()));

        let table_name = driver.quote(&table.name);
        let mut sql = if columns.is_empty() {
            match driver {
                Drivers::MySQL => format!("INSERT INTO {} () VALUES ()", table_name),
                _ => format!("INSERT INTO {} DEFAULT VALUES", table_name),
            }
        } else {
            let names: Vec<String> = columns.iter().map(|(c, _)| driver.quote(c)).collect();
            let placeholders: Vec<String> = (1..=columns.len()).map(|n| driver.placeholder(n)).collect();
            format!("INSERT INTO {} ({}) VALUES ({})", table_name, names.join(", "), placeholders.join(", "))
        };
        let values: Vec<Value> = columns.into_iter().map(|(_, v)| v).collect();

        if needs_key {
            let key_column = primary_key[0];
            let key = if driver == Drivers::Postgres {
                sql.push_str(&format!(" RETURNING {}", driver.quote(key_column)));
                let row = self.fetch_one(&sql, &values).await?;
                decode_column(&row, 0)?
            } else {
                let result = self.execute(&sql, &values).await?;
                let id = result
                    .last_insert_id()
                    .ok_or_else(|| Error::MissingIdentity { class: mapped.name().to_string() })?;
                Value::Integer(id)
            };
            object.lock().values.insert(key_column.to_string(), key);
        } else {
            self.execute(&sql, &values).await?;
        }

        let identity = {
            let mut data = object.lock();
            let identity = Self::identity_of(&mapped, &data.values);
            if identity.iter().any(Value::is_null) {
                return Err(Error::MissingIdentity { class: mapped.name().to_string() });
            }
            data.identity = Some(identity.clone());
            data.state = ObjectState::Persistent;
            data.modified.clear();
            identity
        };
        self.identity_map.insert(identity_key(&mapped, &identity), object.clone());
        Ok(())
    }

    async fn update(&mut self, object: &Object) -> Result<()> {
        let mapped = Arc::clone(object.mapped_type());
        let (assignments, identity) = {
            let mut data = object.lock();
            let modified = std::mem::take(&mut data.modified);
            let assignments: Vec<(String, Value)> = modified
                .into_iter()
                .map(|c| {
                    let value = data.values.get(&c).cloned().unwrap_or(Value::Null);
                    (c, value)
                })
                .collect();
            (assignments, data.identity.clone())
        };
        let identity = identity.ok_or_else(|| Error::MissingIdentity { class: mapped.name().to_string() })?;

        let driver = self.driver();
        let mut values = Vec::new();
        let sets: Vec<String> = assignments
            .into_iter()
            .map(|(column, value)| {
                values.push(value);
                format!("{} = {}", driver.quote(&column), driver.placeholder(values.len()))
            })
            .collect();
        let filter: Vec<(String, Value)> =
            mapped.primary_key().iter().map(|c| c.to_string()).zip(identity.iter().cloned()).collect();
        let sql = format!(
            "UPDATE {} SET {}{}",
            driver.quote(mapped.table_name()),
            sets.join(", "),
            self.where_clause(&filter, None, &mut values)
        );
        self.execute(&sql, &values).await?;

        let current = Self::identity_of(&mapped, &object.lock().values);
        if current != identity {
            self.identity_map.remove(&identity_key(&mapped, &identity));
            self.identity_map.insert(identity_key(&mapped, &current), object.clone());
            object.lock().identity = Some(current);
        }
        Ok(())
    }

    async fn write_association(
        &mut self,
        property: &RelationshipProperty,
        source: &Object,
        target: &Object,
        adding: bool,
    ) -> Result<()> {
        let RelationshipKind::ManyToMany { secondary, local, secondary_local, remote, secondary_remote } = &property.kind
        else {
            return Ok(());
        };
        let local_value = source.lock().values.get(local).cloned().unwrap_or(Value::Null);
        let remote_value = target.lock().values.get(remote).cloned().unwrap_or(Value::Null);
        for (object, value) in [(source, &local_value), (target, &remote_value)] {
            if value.is_null() {
                return Err(Error::MissingIdentity { class: object.class_name().to_string() });
            }
        }

        let driver = self.driver();
        let filter = [(secondary_local.clone(), local_value), (secondary_remote.clone(), remote_value)];
        let mut values = Vec::new();
        let sql = if adding {
            values.extend(filter.iter().map(|(_, v)| v.clone()));
            format!(
                "INSERT INTO {} ({}, {}) VALUES ({}, {})",
                driver.quote(secondary),
                driver.quote(secondary_local),
                driver.quote(secondary_remote),
                driver.placeholder(1),
                driver.placeholder(2)
            )
        } else {
            format!("DELETE FROM {}{}", driver.quote(secondary), self.where_clause(&filter, None, &mut values))
        };
        self.execute(&sql, &values).await?;
        Ok(())
    }

    async fn delete_row(&mut self, object: &Object) -> Result<()> {
        let mapped = Arc::clone(object.mapped_type());
        let identity = object.identity().ok_or_else(|| Error::MissingIdentity { class: mapped.name().to_string() })?;
        let driver = self.driver();

        for property in mapped.relationships() {
            match &property.kind {
                RelationshipKind::OneToMany { local, remote } => {
                    let value = object.lock().values.get(local).cloned().unwrap_or(Value::Null);
                    if value.is_null() {
                        continue;
                    }
                    let target = Arc::clone(self.binding.mapped(&property.target)?);
                    let sql = format!(
                        "UPDATE {} SET {} = NULL WHERE {} = {}",
                        driver.quote(target.table_name()),
                        driver.quote(remote),
                        driver.quote(remote),
                        driver.placeholder(1)
                    );
                    self.execute(&sql, std::slice::from_ref(&value)).await?;

                    for child in self.identity_map.values().filter(|o| o.class_name() == target.name()) {
                        let mut data = child.lock();
                        if data.values.get(remote) == Some(&value) {
                            data.values.insert(remote.clone(), Value::Null);
                        }
                    }
                }
                RelationshipKind::ManyToMany { secondary, local, secondary_local, .. } => {
                    let value = object.lock().values.get(local).cloned().unwrap_or(Value::Null);
                    if value.is_null() {
                        continue;
                    }
                    let sql = format!(
                        "DELETE FROM {} WHERE {} = {}",
                        driver.quote(secondary),
                        driver.quote(secondary_local),
                        driver.placeholder(1)
                    );
                    self.execute(&sql, std::slice::from_ref(&value)).await?;
                }
                RelationshipKind::ManyToOne { .. } => {}
            }
        }

        let filter: Vec<(String, Value)> =
            mapped.primary_key().iter().map(|c| c.to_string()).zip(identity.iter().cloned()).collect();
        let mut values = Vec::new();
        let sql = format!("DELETE FROM {}{}", driver.quote(mapped.table_name()), self.where_clause(&filter, None, &mut values));
        self.execute(&sql, &values).await?;

        self.identity_map.remove(&identity_key(&mapped, &identity));
        object.lock().state = ObjectState::Deleted;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Transaction boundaries
    // ------------------------------------------------------------------------

    /// Flushes and commits the open transaction.
    pub async fn commit(&mut self) -> Result<()> {
        self.flush().await?;
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            log::debug!("committed transaction");
        }
        self.inserted.clear();
        self.removed.clear();
        if self.options.expire_on_commit {
            for object in self.identity_map.values() {
                object.expire_relations();
            }
        }
        Ok(())
    }

    /// Rolls back the open transaction and restores object state.
    ///
    /// Objects inserted since the last commit become transient again, deleted
    /// ones are restored, and every persistent object is reloaded.
    pub async fn rollback(&mut self) -> Result<()> {
        self.check_binding()?;
        self.discard().await?;

        let tracked: Vec<Object> = self.identity_map.values().cloned().collect();
        for object in tracked {
            let Some(identity) = object.identity() else { continue };
            if !self.reload(&object, &identity).await? {
                self.identity_map.remove(&identity_key(object.mapped_type(), &identity));
                object.lock().state = ObjectState::Deleted;
            }
        }

        // the reloads ran in a read-only transaction of their own
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        log::debug!("rolled back transaction");
        Ok(())
    }

    /// Rolls back without reloading and detaches every object.
    pub async fn close(&mut self) -> Result<()> {
        self.discard().await?;
        for (_, object) in self.identity_map.drain() {
            object.expire_relations();
        }
        Ok(())
    }

    async fn discard(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        for object in self.new.drain(..) {
            object.lock().state = ObjectState::Transient;
        }
        self.deleted.clear();

        for object in self.inserted.drain(..) {
            let identity = {
                let mut data = object.lock();
                data.state = ObjectState::Transient;
                data.identity.take()
            };
            if let Some(identity) = identity {
                self.identity_map.remove(&identity_key(object.mapped_type(), &identity));
            }
        }
        for object in self.removed.drain(..) {
            let identity = {
                let mut data = object.lock();
                data.state = ObjectState::Persistent;
                data.identity.clone()
            };
            if let Some(identity) = identity {
                self.identity_map.insert(identity_key(object.mapped_type(), &identity), object);
            }
        }
        Ok(())
    }
}

/// Writes a link's foreign key if its parent's key is known. Returns false
/// when the parent still awaits its generated key.
fn apply_link(link: &Link) -> bool {
    let value = match &link.parent {
        None => Value::Null,
        Some(parent) => {
            let data = parent.lock();
            match data.values.get(&link.parent_column) {
                Some(value) if !value.is_null() => value.clone(),
                _ if data.state == ObjectState::Pending => return false,
                _ => Value::Null,
            }
        }
    };
    let current = link.child.lock().values.get(&link.child_column).cloned();
    if current.as_ref() != Some(&value) {
        link.child.write_column(&link.child_column, value);
    }
    true
}

/// Orders pending objects so that referenced rows are inserted first.
fn insert_order(pending: &[Object], links: &[Link]) -> Vec<Object> {
    let pending_set: HashSet<&Object> = pending.iter().collect();
    let mut parents: HashMap<&Object, Vec<&Object>> = HashMap::new();
    for link in links {
        if let Some(parent) = &link.parent {
            if parent != &link.child && pending_set.contains(parent) && pending_set.contains(&link.child) {
                parents.entry(&link.child).or_default().push(parent);
            }
        }
    }

    let mut remaining: Vec<&Object> = pending.iter().collect();
    let mut done: HashSet<&Object> = HashSet::new();
    let mut ordered = Vec::with_capacity(pending.len());
    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .position(|o| parents.get(o).is_none_or(|ps| ps.iter().all(|p| done.contains(p))))
            .unwrap_or(0);
        let object = remaining.remove(ready);
        done.insert(object);
        ordered.push(object.clone());
    }
    ordered
}
