//! # Value Module
//!
//! Dynamic values flowing between mapped objects and the database.
//!
//! - [`Value`] is a single scalar column value.
//! - [`FieldValue`] is what can be assigned to an attribute: a scalar, a single
//!   related object, or a collection of related objects.
//! - [`Fields`] is an ordered attribute -> value map, usually built with the
//!   [`fields!`](crate::fields) macro.

// ============================================================================
// External Crate Imports
// ============================================================================

use serde::Serialize;
use sqlx::{
    Arguments, Row, TypeInfo, ValueRef,
    any::{AnyArguments, AnyRow},
};
use std::fmt;

// ============================================================================
// Internal Crate Imports
// ============================================================================

use crate::{object::Object, schema::ColumnType};

// ============================================================================
// Scalar Values
// ============================================================================

/// A scalar column value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL `NULL`
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Stable textual form used to key the identity map.
    pub(crate) fn key_repr(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => format!("b:{b}"),
            Value::Integer(i) => format!("i:{i}"),
            Value::Real(f) => format!("r:{f}"),
            Value::Text(s) => format!("t:{s}"),
            Value::Blob(b) => format!("x:{b:?}"),
        }
    }

    /// Adjusts a decoded value to the declared column type.
    ///
    /// SQLite has no boolean storage class, so booleans come back as integers.
    pub(crate) fn coerce(self, column_type: ColumnType) -> Value {
        match (column_type, self) {
            (ColumnType::Boolean, Value::Integer(i)) => Value::Bool(i != 0),
            (_, value) => value,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Integer(i) => write!(f, "{i}"),
            Value::Real(r) => write!(f, "{r}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::Blob(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl PartialEq<&str> for Value {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

macro_rules! impl_value_from {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for Value {
                fn from(value: $t) -> Self {
                    Value::$variant(value.into())
                }
            }
        )*
    };
}

impl_value_from!(
    bool => Bool,
    i8 => Integer,
    i16 => Integer,
    i32 => Integer,
    i64 => Integer,
    u8 => Integer,
    u16 => Integer,
    u32 => Integer,
    f32 => Real,
    f64 => Real,
    String => Text,
    Vec<u8> => Blob,
);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

// ============================================================================
// Attribute Values
// ============================================================================

/// A value assignable to a mapped attribute.
#[derive(Debug, Clone)]
pub enum FieldValue {
    /// A column value.
    Scalar(Value),
    /// A many-to-one reference.
    One(Option<Object>),
    /// The full contents of a collection relationship.
    Many(Vec<Object>),
}

impl FieldValue {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            FieldValue::Scalar(_) => "a scalar value",
            FieldValue::One(_) => "a single object",
            FieldValue::Many(_) => "a collection of objects",
        }
    }
}

macro_rules! impl_field_value_scalar {
    ($($t:ty),* $(,)?) => {
        $(
            impl From<$t> for FieldValue {
                fn from(value: $t) -> Self {
                    FieldValue::Scalar(value.into())
                }
            }
        )*
    };
}

impl_field_value_scalar!(Value, bool, i8, i16, i32, i64, u8, u16, u32, f32, f64, String, Vec<u8>, &str);

impl From<Option<&str>> for FieldValue {
    fn from(value: Option<&str>) -> Self {
        FieldValue::Scalar(value.into())
    }
}

impl From<Option<String>> for FieldValue {
    fn from(value: Option<String>) -> Self {
        FieldValue::Scalar(value.into())
    }
}

impl From<Option<i64>> for FieldValue {
    fn from(value: Option<i64>) -> Self {
        FieldValue::Scalar(value.into())
    }
}

impl From<Object> for FieldValue {
    fn from(value: Object) -> Self {
        FieldValue::One(Some(value))
    }
}

impl From<&Object> for FieldValue {
    fn from(value: &Object) -> Self {
        FieldValue::One(Some(value.clone()))
    }
}

impl From<Option<Object>> for FieldValue {
    fn from(value: Option<Object>) -> Self {
        FieldValue::One(value)
    }
}

impl From<Vec<Object>> for FieldValue {
    fn from(value: Vec<Object>) -> Self {
        FieldValue::Many(value)
    }
}

/// An ordered attribute -> value map.
///
/// Inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default)]
pub struct Fields {
    entries: Vec<(String, FieldValue)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
        self
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl IntoIterator for Fields {
    type Item = (String, FieldValue);
    type IntoIter = std::vec::IntoIter<(String, FieldValue)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

impl<K: Into<String>, V: Into<FieldValue>> FromIterator<(K, V)> for Fields {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut fields = Fields::new();
        for (k, v) in iter {
            fields.insert(k, v);
        }
        fields
    }
}

/// Builds a [`Fields`] map.
///
/// ```rust,ignore
/// let thing = orm.new_object("Thing", fields! { "name" => "Rumplestiltskin" })?;
/// ```
#[macro_export]
macro_rules! fields {
    () => {
        $crate::Fields::new()
    };
    ($($key:expr => $value:expr),+ $(,)?) => {{
        let mut fields = $crate::Fields::new();
        $( fields.insert($key, $value); )+
        fields
    }};
}

// ============================================================================
// Driver Glue
// ============================================================================

/// Appends a value to a set of query arguments.
pub(crate) fn bind_value(args: &mut AnyArguments<'_>, value: &Value) -> Result<(), sqlx::Error> {
    let result = match value {
        Value::Null => args.add(Option::<String>::None),
        Value::Bool(b) => args.add(*b),
        Value::Integer(i) => args.add(*i),
        Value::Real(r) => args.add(*r),
        Value::Text(s) => args.add(s.clone()),
        Value::Blob(b) => args.add(b.clone()),
    };
    result.map_err(sqlx::Error::Encode)
}

/// Builds query arguments from a list of values.
pub(crate) fn arguments<'q>(values: &[Value]) -> Result<AnyArguments<'q>, sqlx::Error> {
    let mut args = AnyArguments::default();
    for value in values {
        bind_value(&mut args, value)?;
    }
    Ok(args)
}

/// Decodes one column of a row, whatever its runtime type.
pub(crate) fn decode_column(row: &AnyRow, index: usize) -> Result<Value, sqlx::Error> {
    let kind = {
        let raw = row.try_get_raw(index)?;
        if raw.is_null() {
            return Ok(Value::Null);
        }
        raw.type_info().name().to_string()
    };

    let value = match kind.as_str() {
        "BOOLEAN" => Value::Bool(row.try_get::<bool, _>(index)?),
        "SMALLINT" => Value::Integer(row.try_get::<i16, _>(index)?.into()),
        "INTEGER" => Value::Integer(row.try_get::<i32, _>(index)?.into()),
        "BIGINT" => Value::Integer(row.try_get::<i64, _>(index)?),
        "REAL" => Value::Real(row.try_get::<f32, _>(index)?.into()),
        "DOUBLE" => Value::Real(row.try_get::<f64, _>(index)?),
        "BLOB" => Value::Blob(row.try_get::<Vec<u8>, _>(index)?),
        _ => Value::Text(row.try_get::<String, _>(index)?),
    };
    Ok(value)
}

/// Decodes a column expected to hold text, treating `NULL` as empty.
pub(crate) fn decode_text(row: &AnyRow, index: usize) -> Result<String, sqlx::Error> {
    Ok(match decode_column(row, index)? {
        Value::Null => String::new(),
        Value::Text(s) => s,
        Value::Blob(b) => String::from_utf8_lossy(&b).into_owned(),
        other => other.to_string(),
    })
}
