//! Implementation details for the macros exposed by the crate root.

use darling::FromMeta;
use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, DeriveInput};

use crate::find_meta_attrs;

#[derive(Debug, FromMeta)]
struct BinaryValueArgs {
    codec: String,
}

pub fn impl_binary_value(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;

    let meta = find_meta_attrs("binary_value", &input.attrs)
        .map(|meta| BinaryValueArgs::from_nested_meta(&meta).expect("invalid `binary_value` attribute"));

    match meta.map(|args| args.codec) {
        Some(codec) if codec == "bincode" => {}
        Some(other) => panic!("unsupported codec `{}`; only \"bincode\" is supported", other),
        None => panic!("`#[binary_value(codec = \"bincode\")]` attribute is required"),
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    let expanded = quote! {
        impl #impl_generics recordlayer::codec::BinaryValue for #name #ty_generics #where_clause {
            fn to_bytes(&self) -> Vec<u8> {
                bincode::serialize(self).expect("failed to serialize value with bincode")
            }

            fn from_bytes(bytes: std::borrow::Cow<'_, [u8]>) -> recordlayer::Result<Self> {
                bincode::deserialize(&bytes).map_err(|err| {
                    recordlayer::Error::malformed_tuple(format!(
                        "bincode decode of `{}` failed: {}",
                        stringify!(#name),
                        err
                    ))
                })
            }
        }
    };
    expanded.into()
}
