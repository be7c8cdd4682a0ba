//! Procedural macros for topicrpc

use proc_macro::TokenStream;
use syn::{parse_macro_input, ItemImpl};

mod service;

/// Generate a `topicrpc::Service` impl from an inherent impl block
///
/// Every `pub` method shaped `(&self, Arg) -> Result<Reply>` or
/// `(&self, RequestMeta, Arg) -> Result<Reply>`, sync or async, is added to
/// the method table under its lowerCamelCase name (`turn_on` becomes
/// `turnOn`).
///
/// - `#[method(name = "...")]` overrides the name; `#[method]` on a
///   non-`pub` method opts it in.
/// - `#[skip]` leaves a `pub` method out.
/// - `#[service(name = "...")]` sets the service name used in logs.
///
/// ```rust,ignore
/// use topicrpc::{service, RequestMeta, Result};
///
/// pub struct Switch;
///
/// #[service]
/// impl Switch {
///     pub async fn turn_on(&self, _args: ()) -> Result<()> {
///         Ok(())
///     }
///
///     #[method(name = "getState")]
///     pub fn state(&self, meta: RequestMeta, _args: ()) -> Result<bool> {
///         Ok(meta.id.is_some())
///     }
/// }
/// ```
#[proc_macro_attribute]
pub fn service(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut service_args = service::ServiceArgs::default();
    let parser = syn::meta::parser(|meta| service_args.parse(meta));
    parse_macro_input!(args with parser);

    let input = parse_macro_input!(input as ItemImpl);
    service::service_impl(service_args, input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
