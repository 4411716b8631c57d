//! # Probe Derive
//!
//! Procedural macros of probe.
//!
//! - `#[probe::test]` registers an async function as a test case
//! - `#[probe::test(48, 115)]` registers one parameterized case per attribute
//! - `#[probe::test(serial = "ui")]` puts the test into a serial group
//! - `#[probe::main]` generates `run()`, which returns a runner holding every registered test
//!
//! These macros are re-exported by the `probe` crate, so users typically
//! don't need to import this crate directly.

extern crate proc_macro;

use proc_macro::TokenStream;
use quote::{quote, ToTokens};
use syn::{
    parse::Parse, parse_macro_input, punctuated::Punctuated, Expr, ItemFn, LitStr, ReturnType,
    Signature, Token, Type,
};

/// Arguments of the test attribute: `#[test(a, b; "name")]`, optionally with `serial` or
/// `serial = "group"` among them.
struct Input {
    /// Arguments passed to the test function.
    args: Punctuated<Expr, Token![,]>,
    /// Label of a parameterized case, given after the semicolon.
    name: Option<LitStr>,
    /// `None` runs in parallel, `Some(None)` serial within the module, `Some(Some(g))` serial
    /// within group `g`.
    serial: Option<Option<String>>,
}

impl Parse for Input {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let mut serial = None;
        let mut args: Punctuated<Expr, Token![,]> = Punctuated::new();

        while !input.is_empty() && !input.peek(Token![;]) {
            let fork = input.fork();
            let is_serial = fork
                .parse::<syn::Ident>()
                .is_ok_and(|ident| ident == "serial")
                && (fork.is_empty() || fork.peek(Token![,]) || fork.peek(Token![=]) || fork.peek(Token![;]));

            if is_serial {
                input.parse::<syn::Ident>()?;
                serial = Some(if input.peek(Token![=]) {
                    input.parse::<Token![=]>()?;
                    Some(input.parse::<LitStr>()?.value())
                } else {
                    None
                });
            } else {
                args.push(input.parse::<Expr>()?);
            }

            if input.peek(Token![,]) {
                input.parse::<Token![,]>()?;
            } else if !input.is_empty() && !input.peek(Token![;]) {
                return Err(input.error("expected `,` or `;`"));
            }
        }

        let name = if input.parse::<Token![;]>().is_ok() {
            Some(input.parse::<LitStr>()?)
        } else {
            None
        };

        Ok(Input { args, name, serial })
    }
}

/// Arguments as written, e.g. `48, "abc"`.
fn stringify_args(input: &Input) -> Option<String> {
    if input.args.is_empty() {
        return None;
    }
    Some(
        input
            .args
            .iter()
            .map(|expr| expr.to_token_stream().to_string())
            .collect::<Vec<_>>()
            .join(", "),
    )
}

/// Operators spelled out in generated labels, longest first, so `-10` and `10` or
/// `a + b` and `a - b` stay distinct.
const OPERATOR_WORDS: &[(&str, &str)] = &[
    ("<<=", "lshift"),
    (">>=", "rshift"),
    ("+=", "add"),
    ("-=", "sub"),
    ("*=", "mul"),
    ("/=", "div"),
    ("%=", "mod"),
    ("^=", "xor"),
    ("&=", "and"),
    ("|=", "or"),
    ("==", "eq"),
    ("!=", "ne"),
    ("<=", "le"),
    (">=", "ge"),
    ("&&", "and"),
    ("||", "or"),
    ("<<", "lshift"),
    (">>", "rshift"),
    ("+", "add"),
    ("-", "sub"),
    ("*", "mul"),
    ("/", "div"),
    ("%", "mod"),
    ("^", "xor"),
    ("!", "not"),
    ("<", "lt"),
    (">", "gt"),
    ("&", "ref"),
    ("|", "or"),
];

fn spell_operators(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    'outer: while let Some(c) = rest.chars().next() {
        for (op, word) in OPERATOR_WORDS {
            if let Some(tail) = rest.strip_prefix(op) {
                out.push('_');
                out.push_str(word);
                out.push('_');
                rest = tail;
                continue 'outer;
            }
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }
    out
}

/// Name of the registered case: the function name, followed by `::label` for a
/// parameterized case. The label is the name after `;`, or the arguments with operators
/// spelled out, reduced to lowercase alphanumerics joined by `_`.
fn generate_test_name(func_name: &str, input: &Input) -> String {
    if input.args.is_empty() && input.name.is_none() {
        return func_name.to_string();
    }

    let label = match &input.name {
        Some(name) => name.value(),
        None => {
            let raw = input
                .args
                .iter()
                .map(|expr| match expr {
                    Expr::Lit(syn::ExprLit {
                        lit: syn::Lit::Str(s),
                        ..
                    }) => s.value(),
                    other => other.to_token_stream().to_string(),
                })
                .collect::<Vec<_>>()
                .join("_");
            spell_operators(&raw)
                .split(|c: char| !c.is_ascii_alphanumeric())
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("_")
                .to_lowercase()
        }
    };

    format!("{func_name}::{label}")
}

#[derive(Debug, Eq, PartialEq)]
enum ErrorCrate {
    Eyre,
    AnythingElse,
}

/// Determines from the signature whether a test returns `eyre::Result`.
///
/// A proc macro only sees tokens, so `eyre` is detected by its path: `eyre::Result`
/// (or `probe::eyre::Result`) is recognized, an imported alias is not.
fn inspect_error_crate(sig: &Signature) -> syn::Result<ErrorCrate> {
    let ReturnType::Type(_, ty) = &sig.output else {
        return Err(syn::Error::new_spanned(
            sig,
            "probe test must return a Result, e.g. eyre::Result<()>",
        ));
    };
    let Type::Path(type_path) = ty.as_ref() else {
        return Err(syn::Error::new_spanned(ty, "probe test must return a Result"));
    };

    let segments = &type_path.path.segments;
    let is_eyre = segments.len() >= 2
        && segments[segments.len() - 2].ident == "eyre"
        && segments[segments.len() - 1].ident == "Result";
    Ok(if is_eyre {
        ErrorCrate::Eyre
    } else {
        ErrorCrate::AnythingElse
    })
}

/// Marks an async function as a probe test case.
///
/// ```rust,ignore
/// #[probe::test]
/// async fn test_login_api() -> eyre::Result<()> {
///     Ok(())
/// }
///
/// #[probe::test(48, 115; "staging organization")]
/// async fn test_get_organization(org_id: u32, ogs_id: u32) -> eyre::Result<()> {
///     Ok(())
/// }
///
/// #[probe::test(serial = "ui")]
/// async fn test_homepage_load() -> eyre::Result<()> {
///     Ok(())
/// }
/// ```
///
/// The function must be `async` and return a `Result`. `eyre::Result` is passed through;
/// any other error type is wrapped into an `eyre::Report`.
#[proc_macro_attribute]
pub fn test(args: TokenStream, input: TokenStream) -> TokenStream {
    let input_args = parse_macro_input!(args as Input);
    let input_fn = parse_macro_input!(input as ItemFn);

    if input_fn.sig.asyncness.is_none() {
        return syn::Error::new_spanned(&input_fn.sig, "probe test must be an async fn")
            .to_compile_error()
            .into();
    }
    let error_crate = match inspect_error_crate(&input_fn.sig) {
        Ok(error_crate) => error_crate,
        Err(e) => return e.to_compile_error().into(),
    };

    let func_name = &input_fn.sig.ident;
    let test_name = generate_test_name(&func_name.to_string(), &input_args);
    let args = input_args.args.to_token_stream();
    let args_str = match stringify_args(&input_args) {
        Some(s) => quote! { Some(#s) },
        None => quote! { None },
    };
    let serial_group = match &input_args.serial {
        None => quote! { None },
        Some(None) => quote! { Some(module_path!()) },
        Some(Some(group)) => quote! { Some(#group) },
    };

    // The runner expects `eyre::Result`; other error types are boxed into one.
    let body = match error_crate {
        ErrorCrate::Eyre => quote! { #func_name(#args).await },
        ErrorCrate::AnythingElse => quote! {
            #func_name(#args).await.map_err(|e| ::probe::eyre::eyre!(Box::new(e)))
        },
    };

    quote! {
        #input_fn

        ::probe::inventory::submit! {
            ::probe::TestRegistration {
                module: module_path!(),
                name: #test_name,
                args: #args_str,
                serial_group: #serial_group,
                line: line!(),
                test_fn: || {
                    Box::pin(async move {
                        #body
                    })
                },
            }
        }
    }
    .into()
}

/// Generates `run()`, which returns a `probe::Runner` holding every test registered with
/// `#[probe::test]`.
///
/// ```rust,ignore
/// #[probe::main]
/// #[tokio::main]
/// async fn main() -> eyre::Result<()> {
///     let runner = run();
///     let app = probe::App::new();
///     app.run(runner).await?;
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn main(_args: TokenStream, input: TokenStream) -> TokenStream {
    let main_fn = parse_macro_input!(input as ItemFn);

    let output = quote! {
        fn run() -> ::probe::Runner {
            let mut runner = ::probe::Runner::new();

            for test in ::probe::inventory::iter::<::probe::TestRegistration> {
                runner.add_test(
                    test.name,
                    test.module,
                    test.args,
                    test.serial_group,
                    test.line,
                    std::sync::Arc::new(test.test_fn),
                );
            }

            runner
        }

        #main_fn
    };

    output.into()
}
