use proc_macro2::TokenStream;
use quote::quote;
use syn::{GenericArgument, PathArguments, Type};

/// Maps a Rust field type to a column type.
///
/// Returns a tuple containing:
/// 1. Tokens for the `ColumnType` variant, or `None` when the type has no
///    obvious column counterpart and is left to reflection.
/// 2. A boolean indicating if the type is nullable (`Option<T>`).
pub fn rust_type_to_column(ty: &Type) -> (Option<TokenStream>, bool) {
    let Type::Path(type_path) = ty else {
        return (None, false);
    };
    let Some(segment) = type_path.path.segments.last() else {
        return (None, false);
    };
    let type_name = segment.ident.to_string();

    // Option<T> is a nullable T
    if type_name == "Option" {
        if let Some(inner_ty) = first_type_argument(&segment.arguments) {
            let (inner, _ignored_nullable) = rust_type_to_column(inner_ty);
            return (inner, true);
        }
    }

    let variant = match type_name.as_str() {
        "i8" | "i16" | "i32" | "u8" | "u16" => quote! { Integer },
        "i64" | "u32" | "u64" | "isize" | "usize" => quote! { BigInt },
        "f32" | "f64" => quote! { Real },
        "String" | "str" => quote! { Text },
        "bool" => quote! { Boolean },
        "Vec" if is_byte_vec(&segment.arguments) => quote! { Blob },
        _ => return (None, false),
    };
    (Some(quote! { ::reflect_orm::ColumnType::#variant }), false)
}

fn first_type_argument(arguments: &PathArguments) -> Option<&Type> {
    match arguments {
        PathArguments::AngleBracketed(args) => args.args.iter().find_map(|arg| match arg {
            GenericArgument::Type(ty) => Some(ty),
            _ => None,
        }),
        _ => None,
    }
}

fn is_byte_vec(arguments: &PathArguments) -> bool {
    matches!(first_type_argument(arguments), Some(Type::Path(p)) if p.path.is_ident("u8"))
}
