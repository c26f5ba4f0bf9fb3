//! # Object Module
//!
//! Instances of mapped types. An [`Object`] is a shared handle: clones refer to
//! the same row state, and equality is identity.
//!
//! Relationship state is mirrored into the inverse side as soon as it changes,
//! but each link is recorded once. Links backed by a foreign key are recorded
//! on the row holding the key; many-to-many links on the side that initiated
//! them. A flush replays the recorded changes.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
    hash::{Hash, Hasher},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{
    Error, Result,
    mapper::{MappedType, RelationshipKind, RelationshipProperty},
    value::{FieldValue, Value},
};

/// Lifecycle of an object relative to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Constructed in memory, unknown to any session.
    Transient,
    /// Added to a session, not yet flushed.
    Pending,
    /// Backed by a row.
    Persistent,
    /// Its row was deleted by a flush.
    Deleted,
}

/// Loaded state of one relationship.
#[derive(Debug, Clone)]
pub(crate) enum RelationState {
    Unloaded,
    One(Option<Object>),
    Many(Vec<Object>),
    /// An unloaded collection plus objects appended since.
    Appended(Vec<Object>),
}

/// A relationship change waiting for the next flush.
#[derive(Debug, Clone)]
pub(crate) enum Change {
    Set { relationship: String, target: Option<Object> },
    Add { relationship: String, target: Object },
    Remove { relationship: String, target: Object },
}

impl Change {
    pub(crate) fn is_add(&self, relationship: &str, target: &Object) -> bool {
        matches!(self, Change::Add { relationship: r, target: t } if r == relationship && t == target)
    }

    pub(crate) fn is_remove(&self, relationship: &str, target: &Object) -> bool {
        matches!(self, Change::Remove { relationship: r, target: t } if r == relationship && t == target)
    }
}

#[derive(Debug)]
pub(crate) struct ObjectData {
    /// column -> value
    pub values: BTreeMap<String, Value>,
    /// Missing entries are unloaded.
    pub relations: BTreeMap<String, RelationState>,
    /// Columns written since the last flush.
    pub modified: BTreeSet<String>,
    pub changes: Vec<Change>,
    pub state: ObjectState,
    /// Primary key values of the backing row.
    pub identity: Option<Vec<Value>>,
}

impl ObjectData {
    pub fn relation(&self, name: &str) -> &RelationState {
        self.relations.get(name).unwrap_or(&RelationState::Unloaded)
    }

    /// Records a change, cancelling its pending opposite instead when there is one.
    fn record(&mut self, change: Change) {
        let opposite = match &change {
            Change::Add { relationship, target } => self.changes.iter().position(|c| c.is_remove(relationship, target)),
            Change::Remove { relationship, target } => self.changes.iter().position(|c| c.is_add(relationship, target)),
            Change::Set { relationship, .. } => {
                self.changes.retain(|c| !matches!(c, Change::Set { relationship: r, .. } if r == relationship));
                None
            }
        };
        match opposite {
            Some(index) => {
                self.changes.remove(index);
            }
            None => self.changes.push(change),
        }
    }
}

struct Inner {
    mapped: Arc<MappedType>,
    data: Mutex<ObjectData>,
}

/// An instance of a mapped type.
#[derive(Clone)]
pub struct Object(Arc<Inner>);

impl Object {
    fn from_data(mapped: Arc<MappedType>, data: ObjectData) -> Self {
        Object(Arc::new(Inner { mapped, data: Mutex::new(data) }))
    }

    /// A new in-memory object. Its relationships start loaded and empty.
    pub(crate) fn transient(mapped: Arc<MappedType>) -> Self {
        let relations = mapped
            .relationships()
            .map(|property| {
                let state = if property.kind.is_collection() {
                    RelationState::Many(Vec::new())
                } else {
                    RelationState::One(None)
                };
                (property.name.clone(), state)
            })
            .collect();

        Self::from_data(
            mapped,
            ObjectData {
                values: BTreeMap::new(),
                relations,
                modified: BTreeSet::new(),
                changes: Vec::new(),
                state: ObjectState::Transient,
                identity: None,
            },
        )
    }

    /// An object hydrated from a row.
    pub(crate) fn persistent(mapped: Arc<MappedType>, values: BTreeMap<String, Value>, identity: Vec<Value>) -> Self {
        Self::from_data(
            mapped,
            ObjectData {
                values,
                relations: BTreeMap::new(),
                modified: BTreeSet::new(),
                changes: Vec::new(),
                state: ObjectState::Persistent,
                identity: Some(identity),
            },
        )
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ObjectData> {
        self.0.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mapped_type(&self) -> &Arc<MappedType> {
        &self.0.mapped
    }

    pub fn class_name(&self) -> &str {
        self.0.mapped.name()
    }

    pub fn state(&self) -> ObjectState {
        self.lock().state
    }

    /// Primary key values, once the object is backed by a row.
    pub fn identity(&self) -> Option<Vec<Value>> {
        self.lock().identity.clone()
    }

    /// True when the object has unflushed column writes or relationship changes.
    pub fn is_modified(&self) -> bool {
        let data = self.lock();
        !data.modified.is_empty() || !data.changes.is_empty()
    }

    /// Reads a column attribute. Unset columns read as `NULL`.
    pub fn get(&self, attribute: &str) -> Result<Value> {
        let mapped = self.mapped_type();
        let Some(column) = mapped.column_for(attribute) else {
            return Err(match mapped.relationship(attribute) {
                Some(_) => self.type_error(attribute, "a column attribute; relationships are read with `related`"),
                None => Error::unknown_attribute(mapped.name(), attribute),
            });
        };
        Ok(self.lock().values.get(column).cloned().unwrap_or(Value::Null))
    }

    /// The loaded contents of a relationship, or `None` while it is unloaded.
    ///
    /// A many-to-one relationship yields zero or one object.
    pub fn related(&self, relationship: &str) -> Result<Option<Vec<Object>>> {
        self.property(relationship)?;
        Ok(match self.lock().relation(relationship) {
            RelationState::Unloaded | RelationState::Appended(_) => None,
            RelationState::One(target) => Some(target.iter().cloned().collect()),
            RelationState::Many(items) => Some(items.clone()),
        })
    }

    /// Column attribute values by attribute name.
    pub fn values(&self) -> BTreeMap<String, Value> {
        let mapped = self.mapped_type();
        let data = self.lock();
        data.values
            .iter()
            .filter_map(|(column, value)| mapped.attribute_for(column).map(|attr| (attr.to_string(), value.clone())))
            .collect()
    }

    /// Assigns one attribute.
    ///
    /// Scalars go to column attributes, a single object (or `None`) to a
    /// many-to-one relationship and a full list to a loaded collection.
    pub fn set(&self, attribute: &str, value: impl Into<FieldValue>) -> Result<()> {
        let value = value.into();
        self.check(attribute, &value)?;
        self.apply(attribute, value)
    }

    /// Validates an assignment without performing it.
    pub(crate) fn check(&self, attribute: &str, value: &FieldValue) -> Result<()> {
        let mapped = self.mapped_type();
        if mapped.column_for(attribute).is_some() {
            return match value {
                FieldValue::Scalar(_) => Ok(()),
                _ => Err(self.type_error(attribute, "a scalar value")),
            };
        }

        let property = self.property(attribute)?;
        match (property.kind.is_collection(), value) {
            (false, FieldValue::One(target)) => target.iter().try_for_each(|t| self.check_target(property, t)),
            (true, FieldValue::Many(targets)) => {
                if !matches!(self.lock().relation(attribute), RelationState::Many(_)) {
                    return Err(self.type_error(attribute, "a loaded collection; load it with `Session::related` first"));
                }
                targets.iter().try_for_each(|t| self.check_target(property, t))
            }
            (false, _) => Err(self.type_error(attribute, "a single object")),
            (true, _) => Err(self.type_error(attribute, "a collection of objects")),
        }
    }

    /// Performs an assignment that already passed [`check`](Self::check).
    pub(crate) fn apply(&self, attribute: &str, value: FieldValue) -> Result<()> {
        match value {
            FieldValue::Scalar(value) => {
                let column = self
                    .mapped_type()
                    .column_for(attribute)
                    .ok_or_else(|| Error::unknown_attribute(self.class_name(), attribute))?;
                self.write_column(column, value);
                Ok(())
            }
            FieldValue::One(target) => self.set_reference(attribute, target),
            FieldValue::Many(targets) => {
                let current = self.related(attribute)?.unwrap_or_default();
                for item in current.iter().filter(|item| !targets.contains(item)) {
                    self.remove(attribute, item)?;
                }
                for item in targets.iter().filter(|item| !current.contains(item)) {
                    self.append(attribute, item)?;
                }
                Ok(())
            }
        }
    }

    /// Adds `target` to a collection relationship.
    pub fn append(&self, relationship: &str, target: &Object) -> Result<()> {
        let property = self.collection(relationship)?;
        self.check_target(property, target)?;

        {
            let mut data = self.lock();
            match data.relations.get_mut(relationship) {
                Some(RelationState::Many(items) | RelationState::Appended(items)) => {
                    if items.contains(target) {
                        return Ok(());
                    }
                    items.push(target.clone());
                }
                _ => {
                    data.relations.insert(relationship.to_string(), RelationState::Appended(vec![target.clone()]));
                }
            }
        }

        let recorded_elsewhere = match (&property.kind, &property.inverse) {
            (RelationshipKind::OneToMany { .. }, Some(inverse)) => {
                let previous = target.assign_reference(inverse, Some(self.clone()));
                if let Some(previous) = previous.filter(|p| p != self) {
                    previous.mirror_remove(relationship, target);
                }
                true
            }
            (RelationshipKind::ManyToMany { .. }, Some(inverse)) => target.mirror_add(inverse, self),
            _ => false,
        };

        if !recorded_elsewhere {
            self.lock().record(Change::Add { relationship: relationship.to_string(), target: target.clone() });
        }
        Ok(())
    }

    /// Removes `target` from a collection relationship.
    pub fn remove(&self, relationship: &str, target: &Object) -> Result<()> {
        let property = self.collection(relationship)?;

        let removed = {
            let mut data = self.lock();
            match data.relations.get_mut(relationship) {
                Some(RelationState::Many(items)) => {
                    let before = items.len();
                    items.retain(|item| item != target);
                    before != items.len()
                }
                Some(RelationState::Appended(items)) => {
                    items.retain(|item| item != target);
                    true
                }
                _ => true,
            }
        };
        if !removed {
            return Ok(());
        }

        let recorded_elsewhere = match (&property.kind, &property.inverse) {
            (RelationshipKind::OneToMany { .. }, Some(inverse)) => {
                let points_elsewhere = matches!(
                    target.lock().relation(inverse),
                    RelationState::One(Some(parent)) if parent != self
                );
                if !points_elsewhere {
                    target.assign_reference(inverse, None);
                }
                true
            }
            (RelationshipKind::ManyToMany { .. }, Some(inverse)) => target.mirror_remove(inverse, self),
            _ => false,
        };

        if !recorded_elsewhere {
            self.lock().record(Change::Remove { relationship: relationship.to_string(), target: target.clone() });
        }
        Ok(())
    }

    /// Points a many-to-one relationship at `target`.
    pub fn set_reference(&self, relationship: &str, target: Option<Object>) -> Result<()> {
        let property = self.property(relationship)?;
        if property.kind.is_collection() {
            return Err(self.type_error(relationship, "a collection of objects"));
        }
        if let Some(target) = &target {
            self.check_target(property, target)?;
        }

        let previous = self.assign_reference(relationship, target.clone());
        if let Some(inverse) = &property.inverse {
            if let Some(previous) = previous.filter(|p| Some(p) != target.as_ref()) {
                previous.mirror_remove(inverse, self);
            }
            if let Some(target) = &target {
                target.mirror_add(inverse, self);
            }
        }
        Ok(())
    }

    /// Sets a reference and records it, returning the previously loaded target.
    fn assign_reference(&self, relationship: &str, target: Option<Object>) -> Option<Object> {
        let mut data = self.lock();
        let previous = match data.relations.insert(relationship.to_string(), RelationState::One(target.clone())) {
            Some(RelationState::One(previous)) => previous,
            _ => None,
        };
        data.record(Change::Set { relationship: relationship.to_string(), target });
        previous
    }

    /// Reflects a link made from the other side into the loaded collection.
    ///
    /// Returns true when this side already accounts for the link, so the
    /// initiator must not record it again.
    fn mirror_add(&self, relationship: &str, other: &Object) -> bool {
        let mut data = self.lock();
        let cancelled = match data.changes.iter().position(|c| c.is_remove(relationship, other)) {
            Some(index) => {
                data.changes.remove(index);
                true
            }
            None => data.changes.iter().any(|c| c.is_add(relationship, other)),
        };
        if let Some(RelationState::Many(items) | RelationState::Appended(items)) = data.relations.get_mut(relationship) {
            if !items.contains(other) {
                items.push(other.clone());
            }
        }
        cancelled
    }

    /// Counterpart of [`mirror_add`](Self::mirror_add) for unlinking.
    fn mirror_remove(&self, relationship: &str, other: &Object) -> bool {
        let mut data = self.lock();
        if let Some(RelationState::Many(items) | RelationState::Appended(items)) = data.relations.get_mut(relationship) {
            items.retain(|item| item != other);
        }
        match data.changes.iter().position(|c| c.is_add(relationship, other)) {
            Some(index) => {
                data.changes.remove(index);
                true
            }
            None => data.changes.iter().any(|c| c.is_remove(relationship, other)),
        }
    }

    /// Writes a column value and marks it for the next flush.
    pub(crate) fn write_column(&self, column: &str, value: Value) {
        let mut data = self.lock();
        data.values.insert(column.to_string(), value);
        data.modified.insert(column.to_string());
    }

    /// Forgets loaded relationship state so it is read again from storage.
    pub(crate) fn expire_relations(&self) {
        self.lock().relations.clear();
    }

    /// Objects directly linked through loaded state or pending changes.
    pub(crate) fn neighbors(&self) -> Vec<Object> {
        let data = self.lock();
        let mut out = Vec::new();
        for state in data.relations.values() {
            match state {
                RelationState::One(Some(target)) => out.push(target.clone()),
                RelationState::Many(items) | RelationState::Appended(items) => out.extend(items.iter().cloned()),
                _ => {}
            }
        }
        for change in &data.changes {
            match change {
                Change::Set { target: Some(target), .. } | Change::Add { target, .. } => out.push(target.clone()),
                _ => {}
            }
        }
        out
    }

    fn property(&self, name: &str) -> Result<&RelationshipProperty> {
        let mapped = self.mapped_type();
        mapped.relationship(name).ok_or_else(|| Error::unknown_attribute(mapped.name(), name))
    }

    fn collection(&self, name: &str) -> Result<&RelationshipProperty> {
        let property = self.property(name)?;
        if !property.kind.is_collection() {
            return Err(self.type_error(name, "a single object"));
        }
        Ok(property)
    }

    fn check_target(&self, property: &RelationshipProperty, target: &Object) -> Result<()> {
        if target.class_name() != property.target {
            return Err(self.type_error(&property.name, "an object of the related class"));
        }
        Ok(())
    }

    fn type_error(&self, attribute: &str, expected: &'static str) -> Error {
        Error::AttributeType { class: self.class_name().to_string(), attribute: attribute.to_string(), expected }
    }
}

/// The given objects and everything reachable from them through relationships.
pub(crate) fn reachable(roots: impl IntoIterator<Item = Object>) -> Vec<Object> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    let mut stack: Vec<Object> = roots.into_iter().collect();
    while let Some(object) = stack.pop() {
        if !seen.insert(object.clone()) {
            continue;
        }
        stack.extend(object.neighbors());
        out.push(object);
    }
    out
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Object {}

impl Hash for Object {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.0), state);
    }
}

// Related objects are never followed here; cycles would not terminate.
impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.lock();
        f.debug_struct("Object")
            .field("class", &self.class_name())
            .field("state", &data.state)
            .field("identity", &data.identity)
            .field("values", &data.values)
            .finish()
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let json = serde_json::to_string(&self.lock().values).map_err(|_| fmt::Error)?;
        write!(f, "<{}: {}>", self.class_name(), json)
    }
}
