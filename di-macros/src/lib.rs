//! Derive macros for ambit's call-time dependency injection.
//!
//! This crate provides `#[derive(Injectable)]`, which turns a struct of
//! annotated fields into an `ambit::Injectable` implementation. Generated
//! code references `::ambit`, so the consuming crate must depend on `ambit`
//! (ambit itself declares `extern crate self as ambit`).

use proc_macro::TokenStream;

mod injectable;

/// Derive macro for a set of dependencies resolved at call time.
///
/// Each field is resolved from the ambient resolver context according to its
/// `#[inject(...)]` attribute:
///
/// - `dep = "name"`: a dependency definition, field type `Arc<T>`
/// - `config = "dotted.key"`: a configuration value, deserialised into the field type
/// - `default = expr`: used when the dependency is out of scope or the key is absent
/// - `default_factory = closure`: same, evaluated lazily; `default` wins if both are given
///
/// Fields without `#[inject]` are filled with `Default::default()`.
///
/// # Example
///
/// ```ignore
/// use ambit::Injectable;
///
/// #[derive(Injectable)]
/// pub struct SearchDeps {
///     #[inject(dep = "collection")]
///     collection: Arc<DocumentCollection>,
///     #[inject(config = "search.limit", default = 10)]
///     limit: usize,
///     #[inject(dep = "cache", default_factory = || Cache::disabled())]
///     cache: Arc<Cache>,
/// }
///
/// // Generated implementation:
/// // #[async_trait]
/// // impl Injectable for SearchDeps {
/// //     async fn inject() -> Result<Self, DiError> {
/// //         let collection: Arc<DocumentCollection> =
/// //             DependencyPlaceholder::by_name("collection").resolve().await?;
/// //         let limit: usize =
/// //             ConfigValue::new("search.limit").with_default(10).resolve().await?;
/// //         ...
/// //     }
/// // }
/// ```
#[proc_macro_derive(Injectable, attributes(inject))]
pub fn derive_injectable(input: TokenStream) -> TokenStream {
    injectable::derive_injectable_impl(input)
}
