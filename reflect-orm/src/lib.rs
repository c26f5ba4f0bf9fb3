//! # Reflect ORM
//!
//! Object mapping with deferred schema reflection, built on sqlx.
//!
//! Classes are declared as skeletons (by hand, from JSON, or with
//! `#[derive(Skeleton)]`) before any database exists. Binding to a database
//! reflects or creates the tables, resolves relationships against the real
//! schema, and yields mapped types ready for persistence through sessions.
//!
//! ## Example
//!
//! ```rust,ignore
//! use reflect_orm::{Orm, Skeleton, fields};
//!
//! #[derive(Skeleton)]
//! #[orm(table = "users")]
//! struct User {
//!     #[orm(primary_key)]
//!     id: i64,
//!     name: String,
//!     #[orm(relationship = "Address", backref = "user")]
//!     addresses: Vec<Address>,
//! }
//!
//! let mut orm = Orm::new();
//! orm.declare::<User>().declare::<Address>();
//! orm.bind("sqlite://app.db").await?;
//!
//! let ed = orm.get_or_create("User", fields! { "name" => "ed" }).await?;
//! orm.session()?.commit().await?;
//! ```

pub mod binder;
pub mod database;
pub mod error;
pub mod mapper;
pub mod object;
pub mod orm;
pub mod registry;
pub mod resolver;
pub mod schema;
pub mod session;
pub mod skeleton;
pub mod transaction;
pub mod value;

pub use reflect_orm_macro::Skeleton;

pub use binder::{Binding, ConnectionTarget, Reflection, SchemaBinder};
pub use database::{Connection, Database, DatabaseBuilder, Drivers, RawQuery};
pub use error::{Error, Result};
pub use mapper::{MappedType, RelationshipKind, RelationshipProperty};
pub use object::{Object, ObjectState};
pub use orm::{Orm, OrmBuilder};
pub use registry::ClassRegistry;
pub use resolver::update_object;
pub use schema::{ColumnSchema, ColumnType, ForeignKey, MetaData, TableSchema};
pub use session::{Session, SessionFactory, SessionOptions};
pub use skeleton::{Attribute, ClassSkeleton, Declarations, FieldDecl, RelationshipDecl, Skeleton, TableDecl};
pub use transaction::Transaction;
pub use value::{FieldValue, Fields, Value};
