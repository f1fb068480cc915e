//! Implementation of #[derive(Injectable)] proc-macro.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, Data, DeriveInput, Expr, Field, Fields, LitStr};

/// Where a field's value comes from.
enum Source {
    Dependency(LitStr),
    Config(LitStr),
    Default,
}

struct InjectAttr {
    source: Source,
    default: Option<Expr>,
    default_factory: Option<Expr>,
}

pub fn derive_injectable_impl(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let name = &input.ident;
    let generics = &input.generics;
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return syn::Error::new_spanned(
                    &input,
                    "Injectable can only be derived for structs with named fields",
                )
                .to_compile_error()
                .into();
            }
        },
        _ => {
            return syn::Error::new_spanned(&input, "Injectable can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let mut bindings: Vec<proc_macro2::TokenStream> = Vec::new();
    let mut field_names = Vec::new();
    for field in fields {
        let attr = match parse_inject_attr(field) {
            Ok(attr) => attr,
            Err(err) => return err.to_compile_error().into(),
        };
        let Some(field_name) = field.ident.as_ref() else {
            continue;
        };
        let field_type = &field.ty;

        let default = attr
            .default
            .as_ref()
            .map(|expr| quote! { .with_default(#expr) });
        let default_factory = attr
            .default_factory
            .as_ref()
            .map(|expr| quote! { .with_default_factory(#expr) });

        let value = match &attr.source {
            Source::Dependency(dep) => quote! {
                ::ambit::DependencyPlaceholder::by_name(#dep)
                    #default
                    #default_factory
                    .resolve()
                    .await?
            },
            Source::Config(key) => quote! {
                ::ambit::ConfigValue::new(#key)
                    #default
                    #default_factory
                    .resolve()
                    .await?
            },
            Source::Default => quote! { ::std::default::Default::default() },
        };

        bindings.push(quote! { let #field_name: #field_type = #value; });
        field_names.push(field_name);
    }

    let expanded = quote! {
        #[::ambit::async_trait]
        impl #impl_generics ::ambit::Injectable for #name #ty_generics #where_clause {
            async fn inject() -> ::std::result::Result<Self, ::ambit::DiError> {
                #(#bindings)*
                ::std::result::Result::Ok(Self {
                    #(#field_names),*
                })
            }
        }
    };

    TokenStream::from(expanded)
}

fn parse_inject_attr(field: &Field) -> syn::Result<InjectAttr> {
    let mut parsed = InjectAttr {
        source: Source::Default,
        default: None,
        default_factory: None,
    };

    for attr in &field.attrs {
        if !attr.path().is_ident("inject") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("dep") {
                parsed.source = Source::Dependency(meta.value()?.parse()?);
            } else if meta.path.is_ident("config") {
                parsed.source = Source::Config(meta.value()?.parse()?);
            } else if meta.path.is_ident("default") {
                parsed.default = Some(meta.value()?.parse()?);
            } else if meta.path.is_ident("default_factory") {
                parsed.default_factory = Some(meta.value()?.parse()?);
            } else {
                return Err(meta.error(
                    "expected one of `dep`, `config`, `default`, `default_factory`",
                ));
            }
            Ok(())
        })?;
    }

    if matches!(parsed.source, Source::Default)
        && (parsed.default.is_some() || parsed.default_factory.is_some())
    {
        return Err(syn::Error::new_spanned(
            field,
            "`default`/`default_factory` need a `dep` or `config` source",
        ));
    }

    Ok(parsed)
}
