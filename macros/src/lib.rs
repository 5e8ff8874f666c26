use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, parse_quote, spanned::Spanned, Block, Ident, ItemFn, LitStr};

/// Seconds an async test may run before it is reported as hung.
///
/// A lost wake-up in a subject shows up as a task parked forever, so the
/// timeout turns it into a test failure instead of a stuck test binary.
const ASYNC_TEST_TIMEOUT_SECS: u64 = 10;

#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
  let mut input = parse_macro_input!(item as ItemFn);

  let is_async = input.sig.asyncness.is_some();

  let raw_args = proc_macro2::TokenStream::from(attr);
  let tokio_args = if raw_args.is_empty() {
    proc_macro2::TokenStream::new()
  } else {
    if !is_async {
      return TokenStream::from(
        syn::Error::new(
          raw_args.span(),
          "hotrx_macro::test flavor args are only supported for async tests. Use \
           #[hotrx_macro::test] for sync tests, or make the function async.",
        )
        .to_compile_error(),
      );
    }

    let flavor = if let Ok(ident) = syn::parse2::<Ident>(raw_args.clone()) {
      (ident.to_string(), ident.span())
    } else if let Ok(lit) = syn::parse2::<LitStr>(raw_args.clone()) {
      (lit.value(), lit.span())
    } else {
      return TokenStream::from(
        syn::Error::new(
          raw_args.span(),
          "hotrx_macro::test only accepts: #[hotrx_macro::test], #[hotrx_macro::test(local)], \
           #[hotrx_macro::test(shared)], or string equivalents",
        )
        .to_compile_error(),
      );
    };

    match flavor.0.as_str() {
      "local" => quote!(flavor = "current_thread"),
      "shared" => quote!(flavor = "multi_thread", worker_threads = 4),
      _ => {
        return TokenStream::from(
          syn::Error::new(flavor.1, "hotrx_macro::test only accepts: local or shared")
            .to_compile_error(),
        );
      }
    }
  };

  let body = &input.block;
  let init_tracing = quote! {
    let _ = ::tracing_subscriber::fmt()
      .with_env_filter(::tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
  };

  let wrapped: Block = if is_async {
    parse_quote!({
      #init_tracing
      ::tokio::time::timeout(
        ::std::time::Duration::from_secs(#ASYNC_TEST_TIMEOUT_SECS),
        async move #body,
      )
      .await
      .expect("test timed out: a producer or subscriber stayed parked")
    })
  } else {
    parse_quote!({
      #init_tracing
      #body
    })
  };
  input.block = Box::new(wrapped);

  let runner = if is_async { quote!(#[::tokio::test(#tokio_args)]) } else { quote!(#[test]) };

  TokenStream::from(quote! {
    #runner
    #input
  })
}
