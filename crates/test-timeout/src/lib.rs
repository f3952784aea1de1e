//! Test attributes that fail a test instead of letting it hang.
//!
//! `#[tokio_timeout_test]` drives an async test on its own runtime inside a
//! watchdog thread; `#[timeout]` does the same for synchronous tests. Both
//! accept either a bare number of seconds or `key = value` options:
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test(5)]
//! #[test_timeout::tokio_timeout_test(secs = 5, flavor = "multi_thread", workers = 2)]
//! #[test_timeout::timeout(secs = 3)]
//! ```

use proc_macro::TokenStream;
use proc_macro2::{Span, TokenStream as TokenStream2};
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Block, Ident, ItemFn, Lit, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct Options {
    secs: u64,
    flavor: Flavor,
    workers: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            flavor: Flavor::CurrentThread,
            workers: None,
        }
    }
}

struct Setting {
    key: Ident,
    value: Lit,
}

impl Parse for Setting {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let key: Ident = input.parse()?;
        input.parse::<Token![=]>()?;
        let value: Lit = input.parse()?;
        Ok(Self { key, value })
    }
}

impl Parse for Options {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        let mut options = Options::default();
        if input.is_empty() {
            return Ok(options);
        }
        if input.peek(LitInt) {
            let lit: LitInt = input.parse()?;
            options.secs = positive_secs(&lit)?;
            if !input.is_empty() {
                return Err(input.error("expected a single number of seconds"));
            }
            return Ok(options);
        }

        let settings = Punctuated::<Setting, Token![,]>::parse_terminated(input)?;
        for Setting { key, value } in settings {
            match (key.to_string().as_str(), &value) {
                ("secs", Lit::Int(lit)) => options.secs = positive_secs(lit)?,
                ("flavor", Lit::Str(lit)) => {
                    options.flavor = match lit.value().as_str() {
                        "current_thread" => Flavor::CurrentThread,
                        "multi_thread" => Flavor::MultiThread,
                        _ => {
                            return Err(syn::Error::new_spanned(
                                lit,
                                "flavor must be \"current_thread\" or \"multi_thread\"",
                            ))
                        }
                    }
                }
                ("workers", Lit::Int(lit)) => {
                    let workers: usize = lit.base10_parse()?;
                    if workers == 0 {
                        return Err(syn::Error::new_spanned(lit, "workers must be at least 1"));
                    }
                    options.workers = Some(workers);
                }
                _ => {
                    return Err(syn::Error::new_spanned(
                        key,
                        "expected `secs = <int>`, `flavor = \"...\"` or `workers = <int>`",
                    ))
                }
            }
        }
        if options.workers.is_some() && options.flavor == Flavor::CurrentThread {
            return Err(syn::Error::new(
                Span::call_site(),
                "`workers` requires flavor = \"multi_thread\"",
            ));
        }
        Ok(options)
    }
}

fn positive_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = parse_macro_input!(attr as Options);
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

    let runtime = match options.flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => {
            let workers = options.workers.map(|workers| quote! { .worker_threads(#workers) });
            quote! { tokio::runtime::Builder::new_multi_thread() #workers }
        }
    };
    let secs = options.secs;
    let body = quote! {
        let runtime = #runtime
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async move {
            tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                .await
                .expect("test timed out");
        });
    };

    let attrs = strip(attrs, is_tokio_test_attribute);
    watchdog(&attrs, &vis, &sig, secs, body).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = parse_macro_input!(attr as Options);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function; use tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    if options.flavor != Flavor::CurrentThread || options.workers.is_some() {
        return syn::Error::new_spanned(&sig.ident, "runtime options only apply to async tests")
            .to_compile_error()
            .into();
    }

    let body = sync_body(&block);
    let attrs = strip(attrs, is_test_attribute);
    watchdog(&attrs, &vis, &sig, options.secs, body).into()
}

fn sync_body(block: &Block) -> TokenStream2 {
    quote! { (|| #block)(); }
}

/// Runs `body` on a fresh thread and panics if it outlives `secs`.
fn watchdog(
    attrs: &[Attribute],
    vis: &syn::Visibility,
    sig: &syn::Signature,
    secs: u64,
    body: TokenStream2,
) -> TokenStream2 {
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = std::time::Duration::from_secs(#secs);
            let (report, outcome) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    #body
                }));
                let _ = report.send(result);
            });
            match outcome.recv_timeout(limit) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    }
}

fn strip(attrs: Vec<Attribute>, drop: fn(&Attribute) -> bool) -> Vec<Attribute> {
    attrs.into_iter().filter(|attr| !drop(attr)).collect()
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
