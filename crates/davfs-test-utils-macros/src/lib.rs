// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Procedural macros for per-test logging.
//!
//! `#[logged_test]` wraps a test function with
//! [`davfs_test_utils::TestLoggerGuard`] so every test writes its own log
//! file and records success or failure there.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, spanned::Spanned, ItemFn, ReturnType, Type};

/// Attribute macro for synchronous tests.
///
/// ```rust,ignore
/// #[davfs_test_utils::logged_test]
/// fn my_test() {
///     logger.log("running").unwrap();
/// }
/// ```
#[proc_macro_attribute]
pub fn logged_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return syn::Error::new(
            Span::call_site(),
            "#[logged_test] does not accept arguments",
        )
        .to_compile_error()
        .into();
    }

    let input = parse_macro_input!(item as ItemFn);

    if let Some(async_token) = &input.sig.asyncness {
        return syn::Error::new(
            async_token.span(),
            "#[logged_test] cannot be applied to async functions",
        )
        .to_compile_error()
        .into();
    }

    generate_logged_test(input)
}

fn generate_logged_test(mut input: ItemFn) -> TokenStream {
    input.attrs.retain(|attr| !is_logged_attr(attr));

    let fn_ident = &input.sig.ident;
    let fn_name = fn_ident.to_string();
    let visibility = &input.vis;
    let generics = &input.sig.generics;
    let output = &input.sig.output;

    if !input.sig.inputs.is_empty() {
        return syn::Error::new(
            fn_ident.span(),
            "#[logged_test] can only be applied to functions without parameters",
        )
        .to_compile_error()
        .into();
    }

    let (return_kind, return_tokens) = classify_return(output);
    let success_body = build_success_body(return_kind);
    let block = &input.block;
    let other_attrs = &input.attrs;

    let expanded = quote! {
        #[::core::prelude::v1::test]
        #(#other_attrs)*
        #visibility fn #fn_ident #generics () #return_tokens {
            let mut __guard = ::davfs_test_utils::TestLoggerGuard::new(#fn_name)
                .expect("failed to create TestLogger");
            let mut logger = __guard.logger();
            let _ = &mut logger;

            let inner_result = { #block };
            drop(logger);
            #success_body
        }
    };

    expanded.into()
}

#[derive(Clone, Copy)]
enum ReturnKind {
    Unit,
    Result,
    Other,
}

fn classify_return(output: &ReturnType) -> (ReturnKind, proc_macro2::TokenStream) {
    match output {
        ReturnType::Default => (ReturnKind::Unit, quote! {}),
        ReturnType::Type(arrow, ty) => {
            if is_result_type(ty) {
                (ReturnKind::Result, quote! { #arrow #ty })
            } else {
                (ReturnKind::Other, quote! { #arrow #ty })
            }
        }
    }
}

fn is_result_type(ty: &Type) -> bool {
    if let Type::Path(type_path) = ty {
        if let Some(segment) = type_path.path.segments.last() {
            return segment.ident == "Result";
        }
    }
    false
}

fn build_success_body(return_kind: ReturnKind) -> proc_macro2::TokenStream {
    match return_kind {
        ReturnKind::Unit => quote! {
            let _ = inner_result;
            if let Err(e) = __guard.finish_success() {
                panic!("failed to finalize TestLogger: {}", e);
            }
        },
        ReturnKind::Result => quote! {
            match inner_result {
                ::std::result::Result::Ok(value) => {
                    if let Err(e) = __guard.finish_success() {
                        panic!("failed to finalize TestLogger: {}", e);
                    }
                    ::std::result::Result::Ok(value)
                }
                ::std::result::Result::Err(err) => {
                    let __err_msg = format!("{:?}", err);
                    if let Err(e) = __guard.finish_failure(&__err_msg) {
                        eprintln!("failed to finalize TestLogger after error: {}", e);
                    }
                    ::std::result::Result::Err(err)
                }
            }
        },
        ReturnKind::Other => quote! {
            let value = inner_result;
            if let Err(e) = __guard.finish_success() {
                panic!("failed to finalize TestLogger: {}", e);
            }
            value
        },
    }
}

fn is_logged_attr(attr: &syn::Attribute) -> bool {
    attr.path().get_ident().map(|ident| ident == "logged_test").unwrap_or(false)
}
