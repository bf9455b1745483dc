use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{
    parse::Parser, punctuated::Punctuated, Attribute, Expr, ExprAssign, ExprLit, ItemFn, Lit,
    Token,
};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Arguments accepted by the timeout attributes: an optional leading
/// number of seconds and, for async tests, `worker_threads = N`.
struct TimeoutArgs {
    secs: u64,
    worker_threads: Option<usize>,
}

fn parse_args(attr: TokenStream) -> syn::Result<TimeoutArgs> {
    let mut args = TimeoutArgs {
        secs: DEFAULT_TIMEOUT_SECS,
        worker_threads: None,
    };
    let exprs = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for expr in exprs {
        match &expr {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                args.secs = lit.base10_parse()?;
                if args.secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
            }
            Expr::Assign(ExprAssign { left, right, .. }) => {
                let is_threads = matches!(
                    left.as_ref(),
                    Expr::Path(path) if path.path.is_ident("worker_threads")
                );
                let value = match right.as_ref() {
                    Expr::Lit(ExprLit {
                        lit: Lit::Int(lit), ..
                    }) => lit.base10_parse::<usize>()?,
                    other => {
                        return Err(syn::Error::new_spanned(other, "expected an integer literal"))
                    }
                };
                if !is_threads {
                    return Err(syn::Error::new_spanned(left, "unknown argument"));
                }
                if value == 0 {
                    return Err(syn::Error::new_spanned(right, "worker_threads must be positive"));
                }
                args.worker_threads = Some(value);
            }
            other => return Err(syn::Error::new_spanned(other, "unsupported argument")),
        }
    }
    Ok(args)
}

fn runtime_builder(worker_threads: Option<usize>) -> TokenStream2 {
    match worker_threads {
        Some(threads) => quote! {
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(#threads)
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime")
        },
        None => quote! {
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime")
        },
    }
}

/// Runs the test body on its own thread and fails the test once the
/// wall-clock budget is exhausted, even if the body never yields.
fn guarded_body(secs: u64, run: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #run }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test timed out after {}s", #secs)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

fn strip_attrs(attrs: Vec<Attribute>, tokio_path: bool) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|s| s.ident.to_string())
                .collect();
            let is_test = segments == ["test"];
            let is_tokio_test = tokio_path && segments == ["tokio", "test"];
            !(is_test || is_tokio_test)
        })
        .collect()
}

/// Async test with a wall-clock timeout.
///
/// ```ignore
/// #[test_timeout::tokio_timeout_test]
/// async fn places_pixel() { ... }
///
/// #[test_timeout::tokio_timeout_test(10, worker_threads = 2)]
/// async fn fans_out() { ... }
/// ```
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_attrs(attrs, true);
    let secs = args.secs;
    let runtime = runtime_builder(args.worker_threads);
    let run = quote! {
        let runtime = #runtime;
        runtime.block_on(async {
            tokio::time::timeout(std::time::Duration::from_secs(#secs), async move #block)
                .await
                .expect("test timed out");
        });
    };
    let body = guarded_body(secs, run);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}

/// Synchronous test with a wall-clock timeout.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = match parse_args(attr) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };
    if args.worker_threads.is_some() {
        return syn::Error::new(
            proc_macro2::Span::call_site(),
            "worker_threads only applies to tokio_timeout_test",
        )
        .to_compile_error()
        .into();
    }
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attrs(attrs, false);
    let body = guarded_body(args.secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #body
        }
    })
}
