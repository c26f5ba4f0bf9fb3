//! # Reflect ORM Macros
//!
//! Procedural macros for `reflect-orm`.
//!
//! `#[derive(Skeleton)]` turns a struct into a class skeleton. The struct is
//! only a declaration: its fields name the attributes, its `#[orm(...)]`
//! attributes describe columns and relationships.
//!
//! ```rust,ignore
//! #[derive(Skeleton)]
//! #[orm(table = "addresses")]
//! struct Address {
//!     #[orm(primary_key)]
//!     id: i64,
//!     email: String,
//!     #[orm(foreign_key = "users.id")]
//!     user_id: Option<i64>,
//!     #[orm(relationship = "User", back_populates = "addresses")]
//!     user: Option<User>,
//! }
//! ```

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

mod derive_skeleton;
mod types;

/// Derives `reflect_orm::skeleton::Skeleton`.
///
/// Struct attributes: `table = "..."` (defaults to the snake_case struct
/// name) and `class = "..."` (defaults to the struct name).
///
/// Column fields: `primary_key`, `column = "..."`, `foreign_key =
/// "table.column"`, `unique`, `index`, `skip`. `Option<T>` fields are
/// nullable, other non-key fields are `NOT NULL`.
///
/// Relationship fields: `relationship = "Target"` plus optional `secondary`,
/// `primary_join`, `secondary_join`, `backref`, `back_populates` and
/// `remote_side`.
#[proc_macro_derive(Skeleton, attributes(orm))]
pub fn skeleton_derive(input: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(input as DeriveInput);
    derive_skeleton::expand(ast).unwrap_or_else(syn::Error::into_compile_error).into()
}
