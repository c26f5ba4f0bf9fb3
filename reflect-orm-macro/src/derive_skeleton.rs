//! # Skeleton Derive Macro Implementation
//!
//! Expands `#[derive(Skeleton)]` into an `impl Skeleton` whose `skeleton()`
//! builds the `ClassSkeleton` with the same builder calls a hand-written
//! declaration would use.

use heck::ToSnakeCase;
use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Field, Fields, LitStr};

use crate::types::rust_type_to_column;

/// Options of a field marked `#[orm(relationship = "...")]`.
#[derive(Default)]
struct RelationshipAttrs {
    target: Option<String>,
    secondary: Option<String>,
    primary_join: Option<String>,
    secondary_join: Option<String>,
    backref: Option<String>,
    back_populates: Option<String>,
    remote_side: Option<String>,
}

/// Options of a column field.
#[derive(Default)]
struct ColumnAttrs {
    primary_key: bool,
    column: Option<String>,
    foreign_key: Option<String>,
    unique: bool,
    index: bool,
    skip: bool,
}

/// Expands the `#[derive(Skeleton)]` macro.
pub fn expand(ast: DeriveInput) -> syn::Result<TokenStream> {
    let struct_name = &ast.ident;

    let fields = match &ast.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => fields,
            _ => return Err(syn::Error::new_spanned(struct_name, "Skeleton must have named fields")),
        },
        _ => return Err(syn::Error::new_spanned(struct_name, "Skeleton must be a struct")),
    };

    let mut table = struct_name.to_string().to_snake_case();
    let mut class = struct_name.to_string();
    for attr in ast.attrs.iter().filter(|a| a.path().is_ident("orm")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("table") {
                table = meta.value()?.parse::<LitStr>()?.value();
            } else if meta.path.is_ident("class") {
                class = meta.value()?.parse::<LitStr>()?.value();
            } else {
                return Err(meta.error("expected `table` or `class`"));
            }
            Ok(())
        })?;
    }

    let mut attributes = Vec::new();
    for field in &fields.named {
        if let Some(tokens) = expand_field(field)? {
            attributes.push(tokens);
        }
    }

    Ok(quote! {
        impl ::reflect_orm::skeleton::Skeleton for #struct_name {
            fn class_name() -> &'static str {
                #class
            }

            fn skeleton() -> ::reflect_orm::ClassSkeleton {
                ::reflect_orm::ClassSkeleton::new(#table)
                    #(#attributes)*
            }
        }
    })
}

/// One `.field(...)` or `.relationship(...)` call, or nothing for skipped fields.
fn expand_field(field: &Field) -> syn::Result<Option<TokenStream>> {
    let Some(ident) = &field.ident else {
        return Err(syn::Error::new_spanned(field, "Skeleton fields must be named"));
    };
    let name = ident.to_string();

    let mut column = ColumnAttrs::default();
    let mut relationship = RelationshipAttrs::default();

    // Parse attributes #[orm(...)]
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("orm")) {
        attr.parse_nested_meta(|meta| {
            let string = |meta: &syn::meta::ParseNestedMeta| -> syn::Result<String> {
                Ok(meta.value()?.parse::<LitStr>()?.value())
            };

            if meta.path.is_ident("primary_key") {
                column.primary_key = true;
            } else if meta.path.is_ident("unique") {
                column.unique = true;
            } else if meta.path.is_ident("index") {
                column.index = true;
            } else if meta.path.is_ident("skip") {
                column.skip = true;
            } else if meta.path.is_ident("column") {
                column.column = Some(string(&meta)?);
            } else if meta.path.is_ident("foreign_key") {
                let value = string(&meta)?;
                let valid = matches!(value.rsplit_once('.'), Some((table, col)) if !table.is_empty() && !col.is_empty());
                if !valid {
                    return Err(meta.error("Invalid format for foreign_key. Use 'table.column'"));
                }
                column.foreign_key = Some(value);
            } else if meta.path.is_ident("relationship") {
                relationship.target = Some(string(&meta)?);
            } else if meta.path.is_ident("secondary") {
                relationship.secondary = Some(string(&meta)?);
            } else if meta.path.is_ident("primary_join") {
                relationship.primary_join = Some(string(&meta)?);
            } else if meta.path.is_ident("secondary_join") {
                relationship.secondary_join = Some(string(&meta)?);
            } else if meta.path.is_ident("backref") {
                relationship.backref = Some(string(&meta)?);
            } else if meta.path.is_ident("back_populates") {
                relationship.back_populates = Some(string(&meta)?);
            } else if meta.path.is_ident("remote_side") {
                relationship.remote_side = Some(string(&meta)?);
            } else {
                return Err(meta.error("unknown orm attribute"));
            }
            Ok(())
        })?;
    }

    if column.skip {
        return Ok(None);
    }

    if let Some(target) = relationship.target {
        if column.primary_key || column.column.is_some() || column.foreign_key.is_some() {
            return Err(syn::Error::new_spanned(field, "a relationship field cannot carry column options"));
        }
        let options = [
            (quote! { secondary }, relationship.secondary),
            (quote! { primary_join }, relationship.primary_join),
            (quote! { secondary_join }, relationship.secondary_join),
            (quote! { backref }, relationship.backref),
            (quote! { back_populates }, relationship.back_populates),
            (quote! { remote_side }, relationship.remote_side),
        ]
        .into_iter()
        .filter_map(|(method, value)| value.map(|v| quote! { .#method(#v) }));

        return Ok(Some(quote! {
            .relationship(#name, ::reflect_orm::RelationshipDecl::new(#target) #(#options)*)
        }));
    }

    let has_relationship_options = relationship.secondary.is_some()
        || relationship.primary_join.is_some()
        || relationship.secondary_join.is_some()
        || relationship.backref.is_some()
        || relationship.back_populates.is_some()
        || relationship.remote_side.is_some();
    if has_relationship_options {
        return Err(syn::Error::new_spanned(field, "relationship options require `relationship = \"Target\"`"));
    }

    let (column_type, is_nullable) = rust_type_to_column(&field.ty);
    let mut decl = match column_type {
        Some(column_type) => quote! { ::reflect_orm::FieldDecl::new(#column_type) },
        None => quote! { ::reflect_orm::FieldDecl::untyped() },
    };
    if let Some(name) = column.column {
        decl.extend(quote! { .column(#name) });
    }
    if column.primary_key {
        decl.extend(quote! { .primary_key() });
    }
    if is_nullable {
        decl.extend(quote! { .nullable(true) });
    } else if !column.primary_key {
        decl.extend(quote! { .not_null() });
    }
    if let Some(target) = column.foreign_key {
        decl.extend(quote! { .foreign_key(#target) });
    }
    if column.unique {
        decl.extend(quote! { .unique() });
    }
    if column.index {
        decl.extend(quote! { .index() });
    }

    Ok(Some(quote! { .field(#name, #decl) }))
}
