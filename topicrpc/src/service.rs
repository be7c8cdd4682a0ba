//! Service trait, method tables and the topic-keyed service registry
//!
//! A service describes its callable surface once, at registration time,
//! by filling a [`MethodTable`] with typed handlers. There is no runtime
//! introspection: argument and reply types are fixed by the closures the
//! table is built from.

use crate::message::{self, Request, RpcError};
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Request metadata optionally passed to handlers ahead of their argument
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMeta {
    /// Topic the request arrived on
    pub topic: String,
    /// Library-facing method name
    pub method: String,
    /// Correlation id; `None` for notifications
    pub id: Option<u32>,
    /// Sender timestamp in unix milliseconds
    pub time: u64,
}

impl RequestMeta {
    pub fn from_request(topic: &str, request: &Request) -> Self {
        Self {
            topic: topic.to_string(),
            method: request.method.clone(),
            id: request.id,
            time: request.time,
        }
    }
}

/// Type-erased handler: decodes params, runs the method, encodes the reply
pub type Invoker = Arc<dyn Fn(RequestMeta, Option<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// One callable method
#[derive(Clone)]
pub struct MethodDescriptor {
    pub name: String,
    pub arg_type: &'static str,
    pub reply_type: &'static str,
    pub takes_meta: bool,
    invoker: Invoker,
}

impl MethodDescriptor {
    /// Run the handler with raw params
    pub fn invoke(&self, meta: RequestMeta, params: Option<Value>) -> BoxFuture<'static, Result<Value>> {
        (self.invoker)(meta, params)
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("takes_meta", &self.takes_meta)
            .finish()
    }
}

/// A type that can be exported as a service
///
/// Implement by hand or with the `#[service]` attribute macro.
pub trait Service: Send + Sync + Sized + 'static {
    /// Name used in logs and descriptors
    fn service_name() -> &'static str {
        let full = std::any::type_name::<Self>();
        full.rsplit("::").next().unwrap_or(full)
    }

    /// Register every callable method
    fn describe(table: &mut MethodTable<Self>);
}

/// Registration table built by [`Service::describe`]
pub struct MethodTable<S> {
    receiver: Arc<S>,
    methods: BTreeMap<String, MethodDescriptor>,
}

impl<S: Send + Sync + 'static> MethodTable<S> {
    pub fn new(receiver: Arc<S>) -> Self {
        Self {
            receiver,
            methods: BTreeMap::new(),
        }
    }

    /// Register a handler taking the decoded argument
    pub fn method<A, R, F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.method_with_meta::<A, R, _, _>(name, move |receiver, _meta, args| {
            handler(receiver, args)
        });
        if let Some(descriptor) = self.methods.get_mut(&message::from_wire_method(name)) {
            descriptor.takes_meta = false;
        }
        self
    }

    /// Register a handler taking request metadata and the decoded argument
    pub fn method_with_meta<A, R, F, Fut>(&mut self, name: &str, handler: F) -> &mut Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(Arc<S>, RequestMeta, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let name = message::from_wire_method(name);
        let receiver = self.receiver.clone();

        let invoker: Invoker = Arc::new(move |meta: RequestMeta, params: Option<Value>| {
            let args = match message::decode_params::<A>(params) {
                Ok(args) => args,
                Err(e) => return future::ready(Err::<Value, _>(Error::Remote(e))).boxed(),
            };
            let reply = handler(receiver.clone(), meta, args);
            async move {
                let reply = reply.await?;
                Ok::<Value, Error>(serde_json::to_value(reply)?)
            }
            .boxed()
        });

        let descriptor = MethodDescriptor {
            name: name.clone(),
            arg_type: std::any::type_name::<A>(),
            reply_type: std::any::type_name::<R>(),
            takes_meta: true,
            invoker,
        };

        if self.methods.insert(name.clone(), descriptor).is_some() {
            tracing::warn!("⚠️  Method {} registered twice, keeping the last handler", name);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// A receiver bound to its method table
pub struct ServiceDescriptor {
    pub name: String,
    receiver: Arc<dyn Any + Send + Sync>,
    methods: BTreeMap<String, MethodDescriptor>,
}

impl ServiceDescriptor {
    /// Build the method table for `receiver`
    ///
    /// Fails with [`Error::NoEligibleMethods`] if nothing was registered.
    pub fn introspect<S: Service>(receiver: Arc<S>) -> Result<Self> {
        let mut table = MethodTable::new(receiver.clone());
        S::describe(&mut table);

        if table.is_empty() {
            return Err(Error::no_eligible_methods(S::service_name()));
        }

        Ok(Self {
            name: S::service_name().to_string(),
            receiver,
            methods: table.methods,
        })
    }

    /// Method names in sorted order
    pub fn method_names(&self) -> Vec<String> {
        self.methods.keys().cloned().collect()
    }

    pub fn method(&self, name: &str) -> Option<&MethodDescriptor> {
        self.methods.get(name)
    }

    /// Downcast the bound receiver
    pub fn receiver<S: Any + Send + Sync>(&self) -> Option<Arc<S>> {
        self.receiver.clone().downcast::<S>().ok()
    }
}

impl std::fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Topic-keyed registry of exported services
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceDescriptor>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a prepared descriptor to `topic`
    pub fn register(
        &self,
        descriptor: ServiceDescriptor,
        topic: &str,
    ) -> Result<Arc<ServiceDescriptor>> {
        match self.services.entry(topic.to_string()) {
            Entry::Occupied(_) => Err(Error::duplicate_topic(topic)),
            Entry::Vacant(slot) => {
                let descriptor = Arc::new(descriptor);
                slot.insert(descriptor.clone());
                tracing::info!(
                    "📋 Registered {} on {} methods={:?}",
                    descriptor.name,
                    topic,
                    descriptor.method_names()
                );
                Ok(descriptor)
            }
        }
    }

    /// Introspect `receiver` and bind it to `topic`
    pub fn register_service<S: Service>(
        &self,
        receiver: Arc<S>,
        topic: &str,
    ) -> Result<Arc<ServiceDescriptor>> {
        if self.services.contains_key(topic) {
            return Err(Error::duplicate_topic(topic));
        }
        self.register(ServiceDescriptor::introspect(receiver)?, topic)
    }

    pub fn unregister(&self, topic: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.remove(topic).map(|(_, descriptor)| descriptor)
    }

    pub fn service(&self, topic: &str) -> Option<Arc<ServiceDescriptor>> {
        self.services.get(topic).map(|entry| entry.value().clone())
    }

    /// Look up a method, distinguishing an unknown topic from an unknown
    /// method on a known topic
    pub fn get(&self, topic: &str, method: &str) -> Result<MethodDescriptor> {
        let service = self
            .services
            .get(topic)
            .ok_or_else(|| Error::service_not_found(topic))?;
        service
            .method(method)
            .cloned()
            .ok_or_else(|| Error::method_not_found(topic, method))
    }

    /// Registered topics
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.services.iter().map(|entry| entry.key().clone()).collect();
        topics.sort();
        topics
    }

    /// Method names exported on `topic`
    pub fn methods(&self, topic: &str) -> Option<Vec<String>> {
        self.services.get(topic).map(|entry| entry.method_names())
    }

    /// Decode params, invoke the method on the calling task and translate
    /// the outcome for a response
    pub async fn dispatch(
        &self,
        topic: &str,
        request: &Request,
    ) -> std::result::Result<Value, RpcError> {
        let descriptor = match self.get(topic, &request.method) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::debug!("🔍 Dispatch miss on {}: {}", topic, e);
                return Err(RpcError::method_not_found(&request.method));
            }
        };

        let meta = RequestMeta::from_request(topic, request);
        match descriptor.invoke(meta, request.params.clone()).await {
            Ok(value) => Ok(value),
            Err(Error::Remote(error)) => Err(error),
            Err(e) => Err(RpcError::server_error(e.to_string())),
        }
    }
}
