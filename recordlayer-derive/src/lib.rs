//! This crate provides macros for deriving some useful traits for `recordlayer` values.

#![recursion_limit = "128"]
#![deny(unsafe_code, bare_trait_objects)]
#![warn(missing_docs, missing_debug_implementations)]

extern crate proc_macro;

mod db_traits;

use proc_macro::TokenStream;
use syn::{Attribute, NestedMeta};

/// Derives the `BinaryValue` trait for a type that already implements `serde::Serialize` and
/// `serde::Deserialize`.
///
/// The derived implementation encodes through `bincode`, which is currently the only supported
/// codec.
///
/// # Container Attributes
///
/// ## `codec`
///
/// Selects the serialization codec to use. The only accepted value today is `"bincode"`; the
/// attribute is mandatory so that adding further codecs later is not a silent behavior change
/// for existing derives.
///
/// # Examples
///
/// ```ignore
/// #[derive(Clone, Debug, Serialize, Deserialize, BinaryValue)]
/// #[binary_value(codec = "bincode")]
/// pub struct UserRecord {
///     pub id: String,
///     pub balance: u64,
/// }
/// ```
#[proc_macro_derive(BinaryValue, attributes(binary_value))]
pub fn binary_value(input: TokenStream) -> TokenStream {
    db_traits::impl_binary_value(input)
}

pub(crate) fn find_meta_attrs(name: &str, args: &[Attribute]) -> Option<NestedMeta> {
    args.as_ref()
        .iter()
        .filter_map(|a| a.parse_meta().ok())
        .find(|m| m.path().is_ident(name))
        .map(NestedMeta::from)
}
