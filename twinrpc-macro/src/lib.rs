//! # twinrpc procedural macros
//!
//! ## `#[service]`
//!
//! Turns a trait of async methods into a remotely callable service. For
//!
//! ```rust,ignore
//! #[twinrpc::service]
//! pub trait Calculator {
//!     async fn add(&self, a: i64, b: i64) -> twinrpc::Result<i64>;
//!     #[oneway]
//!     async fn reset(&self) -> twinrpc::Result<()>;
//! }
//! ```
//!
//! the macro emits:
//! 1. the trait, with every method rewritten to return
//!    `impl Future<Output = ..> + Send`, a `NAME` constant and a
//!    `twinrpc_export` method building a `BoundService` from an implementation;
//! 2. a `CalculatorProxy` type implementing the trait by calling the remote
//!    side, plus `RemoteService` so channels can hand it out.
//!
//! Methods take `&self` and owned, serializable arguments, and return
//! `Result<T, E>` where `T` is serializable, `E: Display` on the callee side
//! and `E: From<twinrpc::Error>` on the caller side. `#[oneway]` methods must
//! return `Result<()>`; the caller does not wait for them.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{FnArg, ItemTrait, LitStr, ReturnType, TraitItem, parse_macro_input};

/// Defines a twinrpc service.
///
/// The service name defaults to the trait name and can be overridden with
/// `#[service(name = "...")]`. Method signatures on the wire are
/// `method(Type,Type)`.
///
/// # Panics
///
/// Panics at compile time if:
/// - a method is not `async fn name(&self, ..) -> Result<..>`;
/// - a method is generic or has a default body;
/// - a method is named `twinrpc_export` (reserved).
#[proc_macro_attribute]
pub fn service(attr: TokenStream, input: TokenStream) -> TokenStream {
    let mut service_name = None;
    let attr_parser = syn::meta::parser(|meta| {
        if meta.path.is_ident("name") {
            service_name = Some(meta.value()?.parse::<LitStr>()?.value());
            Ok(())
        } else {
            Err(meta.error("unsupported service attribute, expected `name`"))
        }
    });
    parse_macro_input!(attr with attr_parser);

    let mut input = parse_macro_input!(input as ItemTrait);
    let trait_ident = input.ident.clone();
    let visibility = input.vis.clone();
    let service_name = service_name.unwrap_or_else(|| trait_ident.to_string());
    let proxy_ident = format_ident!("{trait_ident}Proxy");

    let krate = get_crate_name();

    let mut export_branches = vec![];
    let mut proxy_methods = vec![];

    for item in &mut input.items {
        let TraitItem::Fn(method) = item else {
            continue;
        };

        if method.default.is_some() {
            panic!("service method `{}` cannot have a default body", method.sig.ident);
        }

        let oneway = method.attrs.iter().any(|a| a.path().is_ident("oneway"));
        method.attrs.retain(|a| !a.path().is_ident("oneway"));

        let sig = &mut method.sig;
        let method_ident = sig.ident.clone();
        if method_ident == "twinrpc_export" {
            panic!("the function cannot be named `twinrpc_export`!");
        }
        if !sig.generics.params.is_empty() {
            panic!("service method `{method_ident}` cannot be generic");
        }
        let valid_receiver = sig
            .receiver()
            .is_some_and(|r| r.reference.is_some() && r.mutability.is_none());
        let ReturnType::Type(_, output) = &sig.output else {
            panic!("service method `{method_ident}` must return a `Result`");
        };
        if sig.asyncness.is_none() || !valid_receiver {
            panic!(
                "the function should be in the form `async fn {method_ident}(&self, ..) -> Result<T>`."
            );
        }
        let output = output.clone();

        let arg_types: Vec<_> = sig
            .inputs
            .iter()
            .filter_map(|arg| match arg {
                FnArg::Typed(pat_type) => Some(pat_type.ty.clone()),
                FnArg::Receiver(_) => None,
            })
            .collect();
        let arg_idents: Vec<_> = (0..arg_types.len())
            .map(|i| format_ident!("arg{i}"))
            .collect();
        let signature = format!(
            "{method_ident}({})",
            arg_types
                .iter()
                .map(|ty| quote!(#ty).to_string().replace(' ', ""))
                .collect::<Vec<_>>()
                .join(",")
        );

        // async fn m(..) -> T  =>  fn m(..) -> impl Future<Output = T> + Send
        sig.asyncness = None;
        sig.output = syn::parse_quote! {
            -> impl ::std::future::Future<Output = #output> + ::std::marker::Send
        };

        let reader = if arg_idents.is_empty() {
            quote! { let args = request.arg_reader(); }
        } else {
            quote! { let mut args = request.arg_reader(); }
        };
        export_branches.push(quote! {
            {
                let this = ::std::sync::Arc::clone(&self);
                service.add_method(#signature, move |request: #krate::ServiceRequest| {
                    let this = ::std::sync::Arc::clone(&this);
                    async move {
                        #reader
                        #( let #arg_idents: #arg_types = args.next_arg()?; )*
                        args.finish()?;
                        match <Self as #trait_ident>::#method_ident(&this, #(#arg_idents),*).await {
                            ::std::result::Result::Ok(value) => request.format.encode(&value),
                            ::std::result::Result::Err(err) => {
                                ::std::result::Result::Err(#krate::Error::from_handler(err))
                            }
                        }
                    }
                });
            }
        });

        let invoke = if oneway {
            quote! {
                self.invoker.notify(#service_name, #signature, args).await?;
                ::std::result::Result::Ok(())
            }
        } else {
            quote! {
                ::std::result::Result::Ok(
                    self.invoker.call(#service_name, #signature, args).await?
                )
            }
        };
        proxy_methods.push(quote! {
            async fn #method_ident(&self, #(#arg_idents: #arg_types),*) -> #output {
                let args = ::std::vec![#(self.invoker.encode_arg(&#arg_idents)?),*];
                #invoke
            }
        });
    }

    let trait_attrs = &input.attrs;
    let trait_items = &input.items;
    let supertraits = &input.supertraits;
    let colon = input.colon_token;
    let proxy_doc = format!("Calls `{service_name}` on a remote peer.");

    quote! {
        #(#trait_attrs)*
        #visibility trait #trait_ident #colon #supertraits {
            const NAME: &'static str = #service_name;

            #(#trait_items)*

            fn twinrpc_export(self: ::std::sync::Arc<Self>) -> #krate::BoundService
            where
                Self: ::std::marker::Sized + ::std::marker::Send + ::std::marker::Sync + 'static,
            {
                let mut service = #krate::BoundService::new(#service_name);
                #(#export_branches)*
                service
            }
        }

        #[doc = #proxy_doc]
        #[derive(Clone, Debug)]
        #visibility struct #proxy_ident {
            invoker: #krate::Invoker,
        }

        impl #krate::RemoteService for #proxy_ident {
            const NAME: &'static str = #service_name;

            fn from_invoker(invoker: #krate::Invoker) -> Self {
                Self { invoker }
            }

            fn invoker(&self) -> &#krate::Invoker {
                &self.invoker
            }
        }

        impl #trait_ident for #proxy_ident {
            #(#proxy_methods)*
        }
    }
    .into()
}

/// Gets the path to the twinrpc crate.
///
/// A renamed dependency is honored; everywhere else, including inside
/// twinrpc itself (which declares `extern crate self as twinrpc`), the
/// absolute path `::twinrpc` is used.
pub(crate) fn get_crate_name() -> proc_macro2::TokenStream {
    match proc_macro_crate::crate_name("twinrpc") {
        Ok(proc_macro_crate::FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote! { ::#ident }
        }
        _ => quote! { ::twinrpc },
    }
}
