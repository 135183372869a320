//! # mqrpc Procedural Macros
//!
//! ## `#[service]`
//!
//! Turns a trait of `async fn` methods into an RPC interface. It generates:
//! - an `mqrpc_export` method registering an implementation with a `Router`
//! - implementations of the trait for `Proxy` and `ReconnectingProxy`
//! - `const NAME`, the interface name used as method-name prefix
//!
//! ```rust,ignore
//! #[mqrpc::service]
//! pub trait Greeter {
//!     async fn greet(&self, name: String) -> mqrpc::Result<String>;
//!
//!     #[rpc(since = 2, streams)]
//!     async fn feed(&self, topic: String) -> mqrpc::Result<mqrpc::RemoteStream<String>>;
//!
//!     #[rpc(no_retry)]
//!     async fn pay(&self, amount: u64) -> mqrpc::Result<()>;
//! }
//! ```
//!
//! Methods take `&self` and owned arguments, and return `mqrpc::Result<T>`.
//! `#[rpc(...)]` accepts:
//! - `since = N`: lowest server protocol version implementing the method
//! - `streams`: the result may embed `RemoteStream`s. Required for every
//!   such method, including results whose own type wraps the streams; a
//!   return type naming `RemoteStream` without it is rejected
//! - `no_retry`: never re-invoked by `ReconnectingProxy` after a connection
//!   failure
//!
//! ## `#[derive(BindStreams)]`
//!
//! Lets a struct or enum carrying `RemoteStream`s travel in a result. Fields
//! whose type does not implement `BindStreams` can be marked
//! `#[bind_streams(skip)]`.

use proc_macro::TokenStream;
use proc_macro2::TokenTree;
use quote::{format_ident, quote};
use syn::{
    Data, DeriveInput, Fields, FnArg, GenericParam, ItemTrait, LitInt, Pat, ReturnType,
    TraitItem, TraitItemFn, Type, parse_macro_input, parse_quote, spanned::Spanned,
};

const FLAG_RETURNS_STREAMS: u8 = 1;
const FLAG_NO_RETRY: u8 = 2;

struct RpcMethod {
    ident: syn::Ident,
    args: Vec<(syn::Ident, Type)>,
    output: Type,
    since: u32,
    flags: u8,
}

/// Defines an RPC interface. See the crate documentation.
#[proc_macro_attribute]
pub fn service(_attr: TokenStream, input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as ItemTrait);
    match expand_service(input) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn expand_service(input: ItemTrait) -> syn::Result<proc_macro2::TokenStream> {
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new(
            input.generics.span(),
            "service traits cannot be generic",
        ));
    }

    let krate = get_crate_name();
    let trait_ident = &input.ident;
    let trait_name = trait_ident.to_string();
    let visibility = &input.vis;
    let attrs = &input.attrs;
    let supertraits = &input.supertraits;
    let colon = input.colon_token;

    let mut trait_items = vec![];
    let mut methods = vec![];
    for item in &input.items {
        let TraitItem::Fn(method) = item else {
            return Err(syn::Error::new(
                item.span(),
                "service traits may only contain methods",
            ));
        };
        let (rewritten, rpc) = parse_method(method)?;
        trait_items.push(rewritten);
        methods.push(rpc);
    }

    let mut export_branches = vec![];
    let mut proxy_methods = vec![];
    let mut reconnecting_methods = vec![];
    for method in &methods {
        let method_ident = &method.ident;
        let method_name = format!("{trait_name}/{method_ident}");
        let since = method.since;
        let flags = method.flags;
        let output = &method.output;
        let arg_idents: Vec<_> = method.args.iter().map(|(ident, _)| ident).collect();
        let arg_types: Vec<_> = method.args.iter().map(|(_, ty)| ty).collect();
        let streams = flags & FLAG_RETURNS_STREAMS != 0;

        let method_info = quote! {
            static METHOD: #krate::MethodInfo = #krate::MethodInfo::new(
                #method_name,
                #since,
                #krate::MethodFlags::from_bits_retain(#flags),
            );
        };

        let add_method = if streams {
            quote! { add_streams_method }
        } else {
            quote! { add_method }
        };
        export_branches.push(quote! {
            {
                #method_info
                let this = self.clone();
                router.#add_method(&METHOD, move |(#(#arg_idents,)*): (#(#arg_types,)*)| {
                    let this = this.clone();
                    async move { this.#method_ident(#(#arg_idents),*).await }
                });
            }
        });

        let invoke = if streams {
            quote! { invoke_streams }
        } else {
            quote! { invoke }
        };
        let signature = quote! {
            fn #method_ident(&self, #(#arg_idents: #arg_types),*)
                -> impl ::core::future::Future<Output = #output> + ::core::marker::Send
        };
        proxy_methods.push(quote! {
            #signature {
                #method_info
                async move { #krate::Proxy::#invoke(self, &METHOD, &(#(#arg_idents,)*)).await }
            }
        });
        reconnecting_methods.push(quote! {
            #signature {
                #method_info
                async move {
                    #krate::ReconnectingProxy::#invoke(self, &METHOD, &(#(#arg_idents,)*)).await
                }
            }
        });
    }

    Ok(quote! {
        #(#attrs)*
        #visibility trait #trait_ident #colon #supertraits {
            const NAME: &'static str = #trait_name;

            #(#trait_items)*

            /// Registers every method of this implementation with `router`.
            #[allow(unused_variables)]
            fn mqrpc_export(
                self: ::std::sync::Arc<Self>,
                router: &mut #krate::Router,
            )
            where
                Self: ::core::marker::Sized + ::core::marker::Send + ::core::marker::Sync + 'static,
            {
                #(#export_branches)*
            }
        }

        impl #trait_ident for #krate::Proxy {
            #(#proxy_methods)*
        }

        impl #trait_ident for #krate::ReconnectingProxy {
            #(#reconnecting_methods)*
        }
    })
}

fn parse_method(method: &TraitItemFn) -> syn::Result<(TraitItemFn, RpcMethod)> {
    let sig = &method.sig;
    let ident = sig.ident.clone();
    if ident == "mqrpc_export" {
        return Err(syn::Error::new(
            ident.span(),
            "the method cannot be named `mqrpc_export`",
        ));
    }
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "service methods must be `async`"));
    }
    if !sig.generics.params.is_empty() {
        return Err(syn::Error::new(
            sig.generics.span(),
            "service methods cannot be generic",
        ));
    }
    match sig.receiver() {
        Some(receiver) if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => {
            return Err(syn::Error::new(
                sig.span(),
                "service methods must take `&self`",
            ));
        }
    }

    let mut args = vec![];
    for input in sig.inputs.iter().skip(1) {
        let FnArg::Typed(arg) = input else {
            continue;
        };
        let Pat::Ident(pat) = arg.pat.as_ref() else {
            return Err(syn::Error::new(
                arg.pat.span(),
                "arguments must be plain identifiers",
            ));
        };
        if matches!(arg.ty.as_ref(), Type::Reference(_)) {
            return Err(syn::Error::new(
                arg.ty.span(),
                "arguments are sent over the wire and must be owned",
            ));
        }
        args.push((pat.ident.clone(), arg.ty.as_ref().clone()));
    }

    let output: Type = match &sig.output {
        ReturnType::Type(_, ty) => ty.as_ref().clone(),
        ReturnType::Default => {
            return Err(syn::Error::new(
                sig.span(),
                "service methods must return `Result<T>`",
            ));
        }
    };

    let mut since = 0u32;
    let mut flags = 0u8;
    for attr in method.attrs.iter().filter(|attr| attr.path().is_ident("rpc")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("since") {
                let lit: LitInt = meta.value()?.parse()?;
                since = lit.base10_parse()?;
                Ok(())
            } else if meta.path.is_ident("streams") {
                flags |= FLAG_RETURNS_STREAMS;
                Ok(())
            } else if meta.path.is_ident("no_retry") {
                flags |= FLAG_NO_RETRY;
                Ok(())
            } else {
                Err(meta.error("expected `since = N`, `streams` or `no_retry`"))
            }
        })?;
    }
    if flags & FLAG_RETURNS_STREAMS == 0 && mentions_ident(quote!(#output), "RemoteStream") {
        return Err(syn::Error::new(
            sig.output.span(),
            "methods returning `RemoteStream`s must be marked `#[rpc(streams)]`",
        ));
    }

    let mut rewritten = method.clone();
    rewritten.attrs.retain(|attr| !attr.path().is_ident("rpc"));
    rewritten.sig.asyncness = None;
    rewritten.sig.output = parse_quote! {
        -> impl ::core::future::Future<Output = #output> + ::core::marker::Send
    };
    if let Some(block) = rewritten.default.take() {
        rewritten.default = Some(parse_quote!({ async move #block }));
    }

    Ok((
        rewritten,
        RpcMethod {
            ident,
            args,
            output,
            since,
            flags,
        },
    ))
}

fn mentions_ident(tokens: proc_macro2::TokenStream, name: &str) -> bool {
    tokens.into_iter().any(|token| match token {
        TokenTree::Ident(ident) => ident == name,
        TokenTree::Group(group) => mentions_ident(group.stream(), name),
        _ => false,
    })
}

/// Implements `BindStreams` by visiting every field.
#[proc_macro_derive(BindStreams, attributes(bind_streams))]
pub fn derive_bind_streams(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    match expand_bind_streams(input) {
        Ok(tokens) => tokens.into(),
        Err(e) => e.to_compile_error().into(),
    }
}

fn is_skipped(field: &syn::Field) -> syn::Result<bool> {
    let mut skip = false;
    for attr in field
        .attrs
        .iter()
        .filter(|attr| attr.path().is_ident("bind_streams"))
    {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("expected `skip`"))
            }
        })?;
    }
    Ok(skip)
}

fn expand_bind_streams(mut input: DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let krate = get_crate_name();
    for param in &mut input.generics.params {
        if let GenericParam::Type(ty) = param {
            ty.bounds.push(parse_quote!(#krate::BindStreams));
        }
    }

    let body = match &input.data {
        Data::Struct(data) => {
            let mut visits = vec![];
            for (index, field) in data.fields.iter().enumerate() {
                if is_skipped(field)? {
                    continue;
                }
                let member = match &field.ident {
                    Some(ident) => quote!(#ident),
                    None => {
                        let index = syn::Index::from(index);
                        quote!(#index)
                    }
                };
                visits.push(quote! {
                    #krate::BindStreams::visit_streams(&mut self.#member, visitor)?;
                });
            }
            quote! { #(#visits)* }
        }
        Data::Enum(data) => {
            let mut arms = vec![];
            for variant in &data.variants {
                let variant_ident = &variant.ident;
                let mut bindings = vec![];
                let mut visits = vec![];
                for (index, field) in variant.fields.iter().enumerate() {
                    let binding = format_ident!("__field{index}");
                    if !is_skipped(field)? {
                        visits.push(quote! {
                            #krate::BindStreams::visit_streams(#binding, visitor)?;
                        });
                    }
                    bindings.push(binding);
                }
                let pattern = match &variant.fields {
                    Fields::Named(fields) => {
                        let names = fields.named.iter().map(|field| &field.ident);
                        quote! { Self::#variant_ident { #(#names: #bindings),* } }
                    }
                    Fields::Unnamed(_) => quote! { Self::#variant_ident(#(#bindings),*) },
                    Fields::Unit => quote! { Self::#variant_ident },
                };
                arms.push(quote! {
                    #[allow(unused_variables)]
                    #pattern => { #(#visits)* }
                });
            }
            quote! {
                match self {
                    #(#arms)*
                }
            }
        }
        Data::Union(data) => {
            return Err(syn::Error::new(
                data.union_token.span(),
                "BindStreams cannot be derived for unions",
            ));
        }
    };

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        impl #impl_generics #krate::BindStreams for #name #ty_generics #where_clause {
            fn visit_streams(
                &mut self,
                visitor: &mut dyn #krate::StreamVisitor,
            ) -> #krate::Result<()> {
                #body
                ::core::result::Result::Ok(())
            }
        }
    })
}

/// Gets the path to import mqrpc from.
///
/// - `::mqrpc` when the macro is used by a dependent crate
/// - `crate` inside mqrpc itself
pub(crate) fn get_crate_name() -> proc_macro2::TokenStream {
    match proc_macro_crate::crate_name("mqrpc") {
        Ok(proc_macro_crate::FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote! { ::#ident }
        }
        _ => quote! { crate },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flags_of(method: &TraitItemFn) -> syn::Result<u8> {
        parse_method(method).map(|(_, rpc)| rpc.flags)
    }

    #[test]
    fn test_streams_marker_is_required() {
        let unmarked: TraitItemFn = parse_quote! {
            async fn feed(&self) -> mqrpc::Result<mqrpc::RemoteStream<u32>>;
        };
        let Err(e) = flags_of(&unmarked) else {
            panic!("an unmarked stream method was accepted");
        };
        assert!(e.to_string().contains("#[rpc(streams)]"));

        let nested: TraitItemFn = parse_quote! {
            async fn feeds(&self) -> mqrpc::Result<Vec<(String, RemoteStream<u32>)>>;
        };
        assert!(flags_of(&nested).is_err());
    }

    #[test]
    fn test_streams_marker_sets_the_flag() {
        let marked: TraitItemFn = parse_quote! {
            #[rpc(streams)]
            async fn feed(&self) -> mqrpc::Result<mqrpc::RemoteStream<u32>>;
        };
        assert_eq!(flags_of(&marked).unwrap(), FLAG_RETURNS_STREAMS);

        // a wrapper type only declares its streams through the marker.
        let wrapped: TraitItemFn = parse_quote! {
            #[rpc(streams, no_retry)]
            async fn pair(&self) -> mqrpc::Result<Pair>;
        };
        assert_eq!(
            flags_of(&wrapped).unwrap(),
            FLAG_RETURNS_STREAMS | FLAG_NO_RETRY
        );

        let plain: TraitItemFn = parse_quote! {
            async fn pair(&self) -> mqrpc::Result<Pair>;
        };
        assert_eq!(flags_of(&plain).unwrap(), 0);
    }

    #[test]
    fn test_since_is_parsed() {
        let method: TraitItemFn = parse_quote! {
            #[rpc(since = 3)]
            async fn greet(&self, name: String) -> mqrpc::Result<String>;
        };
        let (rewritten, rpc) = parse_method(&method).unwrap();
        assert_eq!(rpc.since, 3);
        assert_eq!(rpc.args.len(), 1);
        assert!(rewritten.attrs.is_empty());
        assert!(rewritten.sig.asyncness.is_none());
    }
}
