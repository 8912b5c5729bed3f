//! # Config Derive
//!
//! Derive macro for configuration structs: builder-style setters plus a
//! string-keyed override hook used to layer environment variables on top of
//! defaults.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Data, DeriveInput, Fields, LitBool, parse_macro_input, spanned::Spanned};

/// Derive to generate, for each **named** field:
///
/// - `.set_<field>(&mut self, value: Ty) -> &mut Self`
/// - `const .with_<field>(mut self, value: Ty) -> Self`
///
/// and for the struct as a whole:
///
/// - `.apply_override(&mut self, key, value) -> Result<bool, &'static str>`
///   parses `value` with [`FromStr`](core::str::FromStr) into the field named
///   `key` (case-insensitive). Returns `Ok(false)` for unknown keys and
///   `Err(field)` if the value does not parse.
/// - `FIELD_NAMES`, the list of overridable fields.
///
/// Attributes:
/// - Skip a field entirely: `#[setters(skip)]`
/// - Keep the setters but exclude it from overrides: `#[setters(no_override)]`
///
/// # Example
///
/// ```
/// use config_derive::Setters;
///
/// #[derive(Setters, Default)]
/// struct Limits {
///     retries: u32,
///     timeout_ms: u64,
///     #[setters(no_override)]
///     label: &'static str,
/// }
///
/// let mut l = Limits::default().with_retries(3);
/// assert_eq!(l.apply_override("TIMEOUT_MS", "250"), Ok(true));
/// assert_eq!(l.apply_override("label", "x"), Ok(false));
/// assert_eq!(l.apply_override("retries", "many"), Err("retries"));
/// assert_eq!((l.retries, l.timeout_ms), (3, 250));
/// ```
#[proc_macro_derive(Setters, attributes(setters))]
pub fn derive_generate_setters(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Setters only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(ident.span(), "Setters does not apply to unit structs")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Setters can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();
    let mut override_arms = Vec::new();
    let mut names = Vec::new();

    for field in fields {
        let Some(fname) = &field.ident else { continue };
        let opts = FieldOptions::parse(&field.attrs);
        if opts.skip {
            continue;
        }

        let ty = &field.ty;
        let set_name = format_ident!("set_{}", fname);
        let with_name = format_ident!("with_{}", fname);

        methods.push(quote! {
            #[inline]
            pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                self.#fname = value;
                self
            }

            #[inline]
            #[must_use]
            pub const fn #with_name(mut self, value: #ty) -> Self {
                self.#fname = value;
                self
            }
        });

        if opts.no_override {
            continue;
        }

        let key = fname.to_string();
        override_arms.push(quote! {
            if key.eq_ignore_ascii_case(#key) {
                return match <#ty as ::core::str::FromStr>::from_str(value.trim()) {
                    Ok(parsed) => {
                        self.#fname = parsed;
                        Ok(true)
                    }
                    Err(_) => Err(#key),
                };
            }
        });
        names.push(key);
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            /// Names of the fields accepted by `apply_override`.
            pub const FIELD_NAMES: &'static [&'static str] = &[#(#names),*];

            #(#methods)*

            /// Parse `value` into the field named `key`.
            ///
            /// # Errors
            /// Returns the field name if `value` does not parse into the field's type.
            pub fn apply_override(&mut self, key: &str, value: &str) -> ::core::result::Result<bool, &'static str> {
                #(#override_arms)*
                Ok(false)
            }
        }
    };

    TokenStream::from(expanded)
}

#[derive(Default)]
struct FieldOptions {
    skip: bool,
    no_override: bool,
}

impl FieldOptions {
    fn parse(attrs: &[syn::Attribute]) -> Self {
        let mut opts = Self::default();
        for attr in attrs {
            if !attr.path().is_ident("setters") {
                continue;
            }

            // Accept #[setters(skip)], #[setters(skip = true)] and #[setters(no_override)]
            let _ = attr.parse_nested_meta(|meta| {
                let flag = if meta.input.is_empty() {
                    true
                } else {
                    meta.value()?.parse::<LitBool>()?.value
                };
                if meta.path.is_ident("skip") {
                    opts.skip = flag;
                } else if meta.path.is_ident("no_override") {
                    opts.no_override = flag;
                }
                Ok(())
            });
        }
        opts
    }
}
