//! Wall-clock bounds for tests that touch sockets or child processes.
//!
//! `#[timeout]` wraps a synchronous test, `#[tokio_timeout_test]` an async
//! one (on a fresh current-thread runtime). Both accept a bare integer
//! (seconds) or `ms = N`; the default is 60 seconds.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

struct Bound {
    millis: u64,
}

impl Parse for Bound {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Bound {
                millis: DEFAULT_TIMEOUT_MS,
            });
        }
        let millis = if input.peek(Ident) {
            let unit: Ident = input.parse()?;
            if unit != "ms" {
                return Err(syn::Error::new_spanned(unit, "expected `ms = <millis>` or <seconds>"));
            }
            input.parse::<Token![=]>()?;
            input.parse::<LitInt>()?.base10_parse::<u64>()?
        } else {
            let secs: LitInt = input.parse()?;
            secs.base10_parse::<u64>()?.saturating_mul(1_000)
        };
        if millis == 0 {
            return Err(input.error("timeout must be greater than zero"));
        }
        Ok(Bound { millis })
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let bound = parse_macro_input!(attr as Bound);
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip(attrs, is_tokio_test_attribute);
    let name = sig.ident.to_string();
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .unwrap_or_else(|_| panic!("test `{}` timed out", #name));
        });
    };
    expand(attrs, vis, sig, bound, body)
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let bound = parse_macro_input!(attr as Bound);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip(attrs, is_test_attribute);
    expand(attrs, vis, sig, bound, quote! { #block })
}

/// Runs `body` on a helper thread and fails the test if it outlives the bound.
fn expand(
    attrs: Vec<Attribute>,
    vis: syn::Visibility,
    sig: syn::Signature,
    bound: Bound,
    body: TokenStream2,
) -> TokenStream {
    let millis = bound.millis;
    let name = sig.ident.to_string();
    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_millis(#millis);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test `{}` timed out after {:?}", #name, timeout_duration)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn strip(attrs: Vec<Attribute>, drop_if: fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !drop_if(attr)).collect()
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}

fn is_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!((segments.next(), segments.next()), (Some(first), None) if first.ident == "test")
}
