//! Service macro implementation

use proc_macro2::TokenStream;
use quote::quote;
use syn::spanned::Spanned;
use syn::{Attribute, FnArg, ImplItem, ImplItemFn, ItemImpl, LitStr, PatType, ReturnType, Type, Visibility};

/// Arguments accepted by `#[service(...)]`
#[derive(Debug, Default)]
pub struct ServiceArgs {
    pub name: Option<String>,
}

impl ServiceArgs {
    pub fn parse(&mut self, meta: syn::meta::ParseNestedMeta) -> syn::Result<()> {
        if meta.path.is_ident("name") {
            let name: LitStr = meta.value()?.parse()?;
            self.name = Some(name.value());
            Ok(())
        } else {
            Err(meta.error("unsupported service argument, expected `name = \"...\"`"))
        }
    }
}

/// One method selected for the table
struct ExportedMethod {
    ident: syn::Ident,
    wire_name: String,
    meta_type: Option<Box<Type>>,
    arg_type: Box<Type>,
    is_async: bool,
}

/// Expand `#[service]` on an inherent impl block
pub fn service_impl(args: ServiceArgs, mut input: ItemImpl) -> syn::Result<TokenStream> {
    if let Some((_, path, _)) = &input.trait_ {
        return Err(syn::Error::new_spanned(
            path,
            "#[service] goes on an inherent impl block, not a trait impl",
        ));
    }

    let service_name = match args.name {
        Some(name) => name,
        None => type_name(&input.self_ty)?,
    };

    let mut methods = Vec::new();
    for item in &mut input.items {
        if let ImplItem::Fn(method) = item {
            let skip = take_attr(&mut method.attrs, "skip").is_some();
            let method_attr = take_attr(&mut method.attrs, "method");
            if skip {
                continue;
            }

            let explicit = method_attr.is_some();
            let override_name = match method_attr {
                Some(attr) => parse_method_name(&attr)?,
                None => None,
            };

            if !explicit && !matches!(method.vis, Visibility::Public(_)) {
                continue;
            }

            match select_method(method, override_name)? {
                Some(selected) => methods.push(selected),
                None if explicit => {
                    return Err(syn::Error::new(
                        method.sig.span(),
                        "#[method] needs `(&self, Arg)` or `(&self, RequestMeta, Arg)` returning Result",
                    ))
                }
                None => {}
            }
        }
    }

    let self_ty = &input.self_ty;
    let (impl_generics, _, where_clause) = input.generics.split_for_impl();
    let registrations = methods.iter().map(registration);

    Ok(quote! {
        #input

        impl #impl_generics ::topicrpc::Service for #self_ty #where_clause {
            fn service_name() -> &'static str {
                #service_name
            }

            fn describe(table: &mut ::topicrpc::MethodTable<Self>) {
                #(#registrations)*
            }
        }
    })
}

fn registration(method: &ExportedMethod) -> TokenStream {
    let ident = &method.ident;
    let wire_name = &method.wire_name;
    let arg_type = &method.arg_type;
    let call = if method.is_async {
        quote! { .await }
    } else {
        quote! {}
    };

    match &method.meta_type {
        Some(meta_type) => quote! {
            table.method_with_meta(
                #wire_name,
                |receiver: ::std::sync::Arc<Self>, meta: #meta_type, args: #arg_type| async move {
                    receiver.#ident(meta, args) #call
                },
            );
        },
        None => quote! {
            table.method(
                #wire_name,
                |receiver: ::std::sync::Arc<Self>, args: #arg_type| async move {
                    receiver.#ident(args) #call
                },
            );
        },
    }
}

/// Pick out an eligible method; `None` when the shape does not fit
fn select_method(method: &ImplItemFn, override_name: Option<String>) -> syn::Result<Option<ExportedMethod>> {
    let sig = &method.sig;

    let mut inputs = sig.inputs.iter();
    match inputs.next() {
        Some(FnArg::Receiver(receiver)) if receiver.reference.is_some() && receiver.mutability.is_none() => {}
        _ => return Ok(None),
    }
    if matches!(sig.output, ReturnType::Default) || !sig.generics.params.is_empty() {
        return Ok(None);
    }

    let typed: Vec<&PatType> = inputs
        .filter_map(|arg| match arg {
            FnArg::Typed(pat_type) => Some(pat_type),
            FnArg::Receiver(_) => None,
        })
        .collect();

    let (meta_type, arg_type) = match typed.as_slice() {
        [arg] => (None, arg.ty.clone()),
        [meta, arg] => (Some(meta.ty.clone()), arg.ty.clone()),
        _ => return Ok(None),
    };

    if let Type::Reference(reference) = arg_type.as_ref() {
        return Err(syn::Error::new_spanned(
            reference,
            "service arguments are decoded into owned values; take the argument by value",
        ));
    }

    let wire_name = override_name.unwrap_or_else(|| lower_camel(&sig.ident.to_string()));

    Ok(Some(ExportedMethod {
        ident: sig.ident.clone(),
        wire_name,
        meta_type,
        arg_type,
        is_async: sig.asyncness.is_some(),
    }))
}

fn take_attr(attrs: &mut Vec<Attribute>, name: &str) -> Option<Attribute> {
    let index = attrs.iter().position(|attr| attr.path().is_ident(name))?;
    Some(attrs.remove(index))
}

fn parse_method_name(attr: &Attribute) -> syn::Result<Option<String>> {
    if matches!(attr.meta, syn::Meta::Path(_)) {
        return Ok(None);
    }

    let mut name = None;
    attr.parse_nested_meta(|meta| {
        if meta.path.is_ident("name") {
            let value: LitStr = meta.value()?.parse()?;
            name = Some(value.value());
            Ok(())
        } else {
            Err(meta.error("unsupported method argument, expected `name = \"...\"`"))
        }
    })?;
    Ok(name)
}

fn type_name(ty: &Type) -> syn::Result<String> {
    match ty {
        Type::Path(path) => path
            .path
            .segments
            .last()
            .map(|segment| segment.ident.to_string())
            .ok_or_else(|| syn::Error::new_spanned(ty, "Unable to extract type name")),
        _ => Err(syn::Error::new_spanned(
            ty,
            "#[service] needs a named type; pass `#[service(name = \"...\")]`",
        )),
    }
}

/// `turn_on` -> `turnOn`
pub fn lower_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.trim_start_matches('_').chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}
