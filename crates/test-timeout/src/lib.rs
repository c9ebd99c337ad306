//! Test attributes that fail a test instead of hanging it.
//!
//! `#[tokio_timeout_test]` runs an async test on a dedicated current-thread
//! runtime; `#[timeout]` wraps a synchronous test. Both take an optional
//! budget in seconds (default 60). The async form also accepts
//! `start_paused`, which starts the runtime with a paused clock so sleeps
//! inside the test complete instantly; the budget is then enforced against
//! wall-clock time only.
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]
//! async fn a() {}
//!
//! #[test_timeout::tokio_timeout_test(5)]
//! async fn b() {}
//!
//! #[test_timeout::tokio_timeout_test(secs = 5, start_paused)]
//! async fn c() {}
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ItemFn, Lit, LitInt, Meta, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

struct TimeoutArgs {
    secs: u64,
    start_paused: bool,
}

impl Default for TimeoutArgs {
    fn default() -> Self {
        Self {
            secs: DEFAULT_TIMEOUT_SECS,
            start_paused: false,
        }
    }
}

fn parse_args(attr: TokenStream) -> syn::Result<TimeoutArgs> {
    let mut args = TimeoutArgs::default();
    if attr.is_empty() {
        return Ok(args);
    }

    if let Ok(lit) = syn::parse::<LitInt>(attr.clone()) {
        args.secs = positive_secs(&lit)?;
        return Ok(args);
    }

    let metas = Punctuated::<Meta, Token![,]>::parse_terminated.parse(attr)?;
    for meta in metas {
        match meta {
            Meta::Path(path) if path.is_ident("start_paused") => args.start_paused = true,
            Meta::NameValue(nv) if nv.path.is_ident("secs") => match &nv.value {
                Expr::Lit(ExprLit {
                    lit: Lit::Int(lit), ..
                }) => args.secs = positive_secs(lit)?,
                other => {
                    return Err(syn::Error::new_spanned(other, "secs expects an integer literal"))
                }
            },
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected `secs = N`, `start_paused`, or a bare integer",
                ))
            }
        }
    }
    Ok(args)
}

fn positive_secs(lit: &LitInt) -> syn::Result<u64> {
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(secs)
}

/// Spawns `body` on its own thread and waits for it against a wall-clock budget,
/// re-raising any panic on the test thread.
fn guarded_test(attrs: Vec<Attribute>, func: &ItemFn, secs: u64, body: TokenStream2) -> TokenStream2 {
    let vis = &func.vis;
    let sig = &func.sig;
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#secs);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #body));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut func = match syn::parse::<ItemFn>(item) {
        Ok(func) => func,
        Err(err) => return err.to_compile_error().into(),
    };

    if func.sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    func.sig.asyncness = None;

    let attrs: Vec<Attribute> = func
        .attrs
        .drain(..)
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();
    let block = &func.block;
    let secs = args.secs;

    // A paused clock auto-advances to the next timer whenever the runtime idles,
    // so an in-runtime timeout would fire spuriously; rely on the wall clock.
    let runtime_body = if args.start_paused {
        quote! {
            {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .start_paused(true)
                    .build()
                    .expect("failed to build Tokio runtime");
                runtime.block_on(async move #block);
            }
        }
    } else {
        quote! {
            {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build Tokio runtime");
                runtime.block_on(async {
                    tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                        .await
                        .expect("test timed out");
                });
            }
        }
    };

    guarded_test(attrs, &func, secs, runtime_body).into()
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let mut func = match syn::parse::<ItemFn>(item) {
        Ok(func) => func,
        Err(err) => return err.to_compile_error().into(),
    };

    if func.sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }
    if args.start_paused {
        return syn::Error::new_spanned(
            &func.sig.ident,
            "start_paused only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = func
        .attrs
        .drain(..)
        .filter(|attr| !is_test_attribute(attr))
        .collect();
    let block = &func.block;
    let body = quote! { #block };

    guarded_test(attrs, &func, args.secs, body).into()
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
