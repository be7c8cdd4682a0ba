//! RPC server - wires the bus, the codec and the service registry
//!
//! Each registered service topic gets one bus subscription. Inbound
//! requests are decoded, dispatched on the subscription's delivery worker
//! and answered on `{topic}/reply`. A slow handler stalls only further
//! deliveries for its own topic.

use crate::bus::Bus;
use crate::config::{Clock, SystemClock};
use crate::message::{self, Codec, RequestError, RpcError};
use crate::service::{Service, ServiceDescriptor, ServiceRegistry};
use crate::topic;
use crate::Result;
use dashmap::DashSet;
use serde_json::Value;
use std::sync::{Arc, Weak};

struct ServerInner {
    bus: Bus,
    codec: Codec,
    registry: Arc<ServiceRegistry>,
    /// Topics with a live bus callback; they outlive registry entries
    served: DashSet<String>,
}

/// Serves registered services over a [`Bus`]; cheap to clone
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("client_id", &self.inner.bus.client_id())
            .field("topics", &self.inner.registry.topics())
            .finish()
    }
}

impl Server {
    pub fn new(bus: Bus) -> Self {
        Self::with_clock(bus, Arc::new(SystemClock))
    }

    pub fn with_clock(bus: Bus, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                bus,
                codec: Codec::new(clock),
                registry: Arc::new(ServiceRegistry::new()),
                served: DashSet::new(),
            }),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    pub fn codec(&self) -> &Codec {
        &self.inner.codec
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.inner.registry
    }

    /// Introspect `receiver`, bind it to `topic` and start serving
    pub async fn register_service<S: Service>(
        &self,
        receiver: Arc<S>,
        topic_name: &str,
    ) -> Result<Arc<ServiceDescriptor>> {
        let descriptor = ServiceDescriptor::introspect(receiver)?;
        self.register_descriptor(descriptor, topic_name).await
    }

    /// Bind a prepared descriptor to `topic` and subscribe to it
    ///
    /// The registry entry is rolled back if the subscription fails. A topic
    /// that was served before keeps its bus callback, so registering it
    /// again after [`ServiceRegistry::unregister`] adds no second one.
    pub async fn register_descriptor(
        &self,
        descriptor: ServiceDescriptor,
        topic_name: &str,
    ) -> Result<Arc<ServiceDescriptor>> {
        let descriptor = self.inner.registry.register(descriptor, topic_name)?;

        if self.inner.served.contains(topic_name) {
            tracing::info!("🚀 Serving {} on {} again", descriptor.name, topic_name);
            return Ok(descriptor);
        }

        let server = Arc::downgrade(&self.inner);
        let subscribed = self
            .inner
            .bus
            .subscribe_fn(topic_name, move |topic_name, payload| {
                let server: Weak<ServerInner> = server.clone();
                async move {
                    if let Some(server) = server.upgrade() {
                        server.serve_request(&topic_name, &payload).await;
                    }
                }
            })
            .await;

        if let Err(e) = subscribed {
            self.inner.registry.unregister(topic_name);
            return Err(e);
        }
        self.inner.served.insert(topic_name.to_string());

        tracing::info!("🚀 Serving {} on {}", descriptor.name, topic_name);
        Ok(descriptor)
    }

    /// Decode, dispatch and answer one inbound message
    pub async fn serve_request(&self, topic_name: &str, payload: &[u8]) {
        self.inner.serve_request(topic_name, payload).await;
    }
}

impl ServerInner {
    async fn serve_request(&self, topic_name: &str, payload: &[u8]) {
        let request = match message::decode_request(payload) {
            Ok(request) => request,
            Err(RequestError { id, error }) => {
                tracing::warn!("⚠️  Rejecting request on {}: {}", topic_name, error);
                self.reply(topic_name, id, Err(error)).await;
                return;
            }
        };

        tracing::debug!(
            "📥 {} on {} id={:?}",
            request.method,
            topic_name,
            request.id
        );
        let outcome = self.registry.dispatch(topic_name, &request).await;

        if request.is_notification() {
            if let Err(e) = outcome {
                tracing::warn!(
                    "⚠️  Notification {} on {} failed: {}",
                    request.method,
                    topic_name,
                    e
                );
            }
            return;
        }

        self.reply(topic_name, request.id, outcome).await;
    }

    async fn reply(
        &self,
        topic_name: &str,
        id: Option<u32>,
        outcome: std::result::Result<Value, RpcError>,
    ) {
        let response = self.codec.response(id, outcome);
        let payload = match self.codec.encode_response(&response) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("❌ Failed to encode response id={:?}: {}", id, e);
                return;
            }
        };

        let reply = topic::reply_topic(topic_name);
        if let Err(e) = self.bus.publish(&reply, payload).await {
            tracing::error!("❌ Failed to publish response to {}: {}", reply, e);
        }
    }
}
