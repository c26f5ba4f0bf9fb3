//! # Error Module
//!
//! Every failure in Reflect ORM surfaces as a variant of [`Error`]. Nothing in
//! the crate retries or recovers; callers decide the policy.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type for all Reflect ORM operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The connection descriptor was malformed or the target unreachable.
    #[error("could not connect to `{target}`: {source}")]
    Connection {
        target: String,
        #[source]
        source: sqlx::Error,
    },

    /// A skeleton declares a table or column that the database does not have.
    #[error("class `{class}` does not match table `{table}`: {detail}")]
    SchemaMismatch { class: String, table: String, detail: String },

    /// Two skeletons claim the same table.
    #[error("table `{table}` is claimed by both `{first}` and `{second}`")]
    DuplicateTable { table: String, first: String, second: String },

    /// A session or mapped type was requested before any binding exists.
    #[error("no schema binding exists yet; bind a database first")]
    NotBound,

    /// The session or mapped type belongs to a binding that has been replaced.
    #[error("binding generation {expected} has been replaced by generation {current}")]
    StaleBinding { expected: u64, current: u64 },

    /// A get-or-create predicate matched more than one row.
    #[error("expected at most one `{class}` but {count} rows match")]
    NonUniqueResult { class: String, count: i64 },

    /// An attribute name is not declared on the mapped type.
    #[error("`{class}` has no attribute `{attribute}`")]
    UnknownAttribute { class: String, attribute: String },

    /// A value of the wrong kind was assigned to an attribute.
    #[error("attribute `{class}.{attribute}` expects {expected}")]
    AttributeType { class: String, attribute: String, expected: &'static str },

    /// No skeleton is registered under this class name.
    #[error("no class named `{0}` is registered")]
    UnknownClass(String),

    /// A skeleton or table declaration cannot be mapped as written.
    #[error("invalid declaration for `{class}`: {reason}")]
    InvalidDeclaration { class: String, reason: String },

    /// A relationship's join could not be resolved against the bound schema.
    #[error("cannot resolve relationship `{class}.{relationship}`: {reason}")]
    InvalidJoin { class: String, relationship: String, reason: String },

    /// An inserted row did not yield a complete primary key.
    #[error("`{class}` has no primary key value after insert")]
    MissingIdentity { class: String },

    /// A declaration document could not be parsed.
    #[error("invalid declarations: {0}")]
    Declarations(#[from] serde_json::Error),

    /// Errors reported by the database driver.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl Error {
    pub(crate) fn unknown_attribute(class: &str, attribute: &str) -> Self {
        Self::UnknownAttribute { class: class.to_string(), attribute: attribute.to_string() }
    }

    pub(crate) fn invalid_declaration(class: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDeclaration { class: class.to_string(), reason: reason.into() }
    }
}
