//! RPC client - correlated calls, fire-and-forget calls and event routing
//!
//! A correlated call inserts a pending entry keyed by correlation id,
//! publishes the request and races the response against a deadline.
//! Whichever side removes the pending entry first wins; the other side
//! finds nothing and does nothing.

use crate::bus::Bus;
use crate::config::ClientConfig;
use crate::message::{self, Codec, ResponseHead, RpcError, ServiceAnnouncement, PROTOCOL_VERSION};
use crate::topic;
use crate::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, OnceCell};

type CallOutcome = Result<Option<Box<RawValue>>>;

struct PendingCall {
    topic: String,
    method: String,
    reply: oneshot::Sender<CallOutcome>,
}

/// A notification received through [`Client::subscribe_events`]
#[derive(Debug, Clone, PartialEq)]
pub struct EventMessage {
    /// Concrete topic the event arrived on
    pub topic: String,
    /// Event name, the last segment after `/event/`
    pub name: String,
    pub params: Option<Value>,
    /// Values captured by `:name` segments of the route
    pub captures: HashMap<String, String>,
}

impl EventMessage {
    pub fn params_as<T: DeserializeOwned>(&self) -> Result<T> {
        message::decode_params(self.params.clone()).map_err(Error::Remote)
    }

    pub fn capture(&self, name: &str) -> Option<&str> {
        self.captures.get(name).map(String::as_str)
    }
}

struct ClientInner {
    bus: Bus,
    codec: Codec,
    config: ClientConfig,
    pending: DashMap<u32, PendingCall>,
    next_id: AtomicU32,
    /// One entry per reply topic; initialised once the bus subscribe succeeds
    reply_subscriptions: DashMap<String, Arc<OnceCell<()>>>,
}

/// RPC client bound to a [`Bus`]; cheap to clone
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("client_id", &self.inner.bus.client_id())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

/// Removes the pending entry if the caller stops waiting early
struct PendingGuard<'a> {
    pending: &'a DashMap<u32, PendingCall>,
    id: u32,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

impl Client {
    pub fn new(bus: Bus) -> Self {
        Self::with_config(bus, ClientConfig::default())
    }

    pub fn with_config(bus: Bus, config: ClientConfig) -> Self {
        let codec = Codec::new(config.clock.clone());
        Self {
            inner: Arc::new(ClientInner {
                bus,
                codec,
                config,
                pending: DashMap::new(),
                next_id: AtomicU32::new(rand::random()),
                reply_subscriptions: DashMap::new(),
            }),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    /// Number of correlated calls awaiting a response
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn is_pending(&self, id: u32) -> bool {
        self.inner.pending.contains_key(&id)
    }

    /// Fire-and-forget: publish a request without a correlation id
    pub async fn call<A: Serialize>(&self, topic_name: &str, method: &str, args: &A) -> Result<()> {
        let params = message::encode_params(args)?;
        let payload = self
            .inner
            .codec
            .encode_request(method, params.as_ref(), None)?;
        tracing::debug!("📤 Notify {} on {}", method, topic_name);
        self.inner.bus.publish(topic_name, payload).await
    }

    /// Correlated call using the configured default timeout
    pub async fn call_default<A, R>(&self, topic_name: &str, method: &str, args: &A) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        self.call_with_timeout(topic_name, method, args, self.inner.config.default_timeout)
            .await
    }

    /// Correlated call: resolves with the decoded result, the remote error,
    /// or [`Error::Timeout`] once `timeout` elapses
    pub async fn call_with_timeout<A, R>(
        &self,
        topic_name: &str,
        method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize,
        R: DeserializeOwned,
    {
        let params = message::encode_params(args)?;
        self.ensure_reply_subscription(topic_name).await?;

        let started = Instant::now();
        let (id, mut rx) = self.inner.insert_pending(topic_name, method);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id,
        };

        let payload = self
            .inner
            .codec
            .encode_request(method, params.as_ref(), Some(id))?;
        tracing::debug!("📤 Call {} on {} id={}", method, topic_name, id);
        self.inner.bus.publish(topic_name, payload).await?;

        let received = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(received) => received,
            Err(_) => {
                if self.inner.pending.remove(&id).is_some() {
                    let elapsed = started.elapsed();
                    tracing::warn!(
                        "⏰ Call {} on {} id={} timed out after {:?}",
                        method,
                        topic_name,
                        id,
                        elapsed
                    );
                    return Err(Error::timeout(topic_name, method, id, elapsed));
                }
                // The response claimed the entry first; its signal is in flight
                rx.await
            }
        };

        let raw = received.map_err(|_| {
            Error::connection_msg(format!("call {id} was abandoned before completion"))
        })??;
        decode_result(raw)
    }

    /// Route inbound response bytes to the waiting caller
    ///
    /// Responses without a matching pending entry are late or belong to
    /// another caller sharing the reply topic; they are dropped.
    pub fn handle_response(&self, payload: &[u8]) {
        self.inner.handle_response(payload);
    }

    /// Subscribe to notifications on a parameterized route
    ///
    /// `:name` segments become `+` on the bus and are captured from each
    /// concrete topic; a trailing `/` subscribes to everything below.
    pub async fn subscribe_events<F, Fut>(&self, route: &str, handler: F) -> Result<()>
    where
        F: Fn(EventMessage) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let pattern = topic::route_to_pattern(route);
        let route = route.to_string();
        let handler = Arc::new(handler);

        tracing::info!("📡 Subscribing to events on {} via {}", route, pattern);
        self.inner
            .bus
            .subscribe_fn(&pattern, move |topic_name, payload| {
                let handler = handler.clone();
                let event = decode_event(&route, topic_name, &payload);
                async move {
                    if let Some(event) = event {
                        handler(event).await;
                    }
                }
            })
            .await
    }

    /// Watch every capability announcement for `schema_uri`
    pub async fn discover<F, Fut>(&self, schema_uri: &str, handler: F) -> Result<()>
    where
        F: Fn(ServiceAnnouncement) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let schema_uri = schema_uri.to_string();
        let handler = Arc::new(handler);

        self.inner
            .bus
            .subscribe_fn(topic::MULTI_LEVEL, move |topic_name, payload| {
                let handler = handler.clone();
                let announcement = decode_announcement(&schema_uri, &topic_name, &payload);
                async move {
                    if let Some(announcement) = announcement {
                        handler(announcement).await;
                    }
                }
            })
            .await
    }

    async fn ensure_reply_subscription(&self, topic_name: &str) -> Result<()> {
        let reply = topic::reply_topic(topic_name);
        let cell = self
            .inner
            .reply_subscriptions
            .entry(reply.clone())
            .or_default()
            .clone();

        cell.get_or_try_init(|| async {
            let client = Arc::downgrade(&self.inner);
            self.inner
                .bus
                .subscribe_fn(&reply, move |_, payload| {
                    let client: Weak<ClientInner> = client.clone();
                    async move {
                        if let Some(client) = client.upgrade() {
                            client.handle_response(&payload);
                        }
                    }
                })
                .await
        })
        .await?;
        Ok(())
    }
}

impl ClientInner {
    /// Allocate an id not currently pending and register the call under it
    fn insert_pending(&self, topic_name: &str, method: &str) -> (u32, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        let mut call = Some(PendingCall {
            topic: topic_name.to_string(),
            method: method.to_string(),
            reply: tx,
        });

        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(slot) = self.pending.entry(id) {
                if let Some(call) = call.take() {
                    slot.insert(call);
                }
                return (id, rx);
            }
        }
    }

    fn handle_response(&self, payload: &[u8]) {
        let head = match ResponseHead::peek(payload) {
            Ok(head) => head,
            Err(e) => {
                tracing::warn!("⚠️  Dropping undecodable response: {}", e);
                return;
            }
        };

        let Some(id) = head.id else {
            tracing::debug!("Dropping response without correlation id");
            return;
        };

        let Some((_, call)) = self.pending.remove(&id) else {
            tracing::warn!("⏰ Dropping late or foreign response id={}", id);
            return;
        };

        let outcome = if !head.version_matches() {
            Err(Error::Remote(RpcError::invalid_request(
                format!(
                    "Unsupported protocol version {:?}, expected {PROTOCOL_VERSION:?}",
                    head.jsonrpc
                ),
                payload,
            )))
        } else if let Some(error) = head.error {
            Err(Error::Remote(error))
        } else {
            Ok(head.result)
        };

        tracing::debug!("📥 Response for {} on {} id={}", call.method, call.topic, id);
        if call.reply.send(outcome).is_err() {
            tracing::debug!("Caller for id={} stopped waiting", id);
        }
    }
}

fn decode_result<R: DeserializeOwned>(raw: Option<Box<RawValue>>) -> Result<R> {
    let text = raw.as_deref().map(RawValue::get).unwrap_or("null");
    serde_json::from_str(text).map_err(|e| Error::serialization("Failed to decode call result", e))
}

fn decode_event(route: &str, topic_name: String, payload: &[u8]) -> Option<EventMessage> {
    let captures = topic::match_route(route, &topic_name)?;
    let request = match message::decode_request(payload) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!("⚠️  Undecodable event on {}: {}", topic_name, e.error);
            return None;
        }
    };
    if !request.is_notification() {
        return None;
    }

    let name = topic::split_event_topic(&topic_name)
        .map(|(_, name)| name.to_string())
        .unwrap_or(request.method);

    Some(EventMessage {
        topic: topic_name,
        name,
        params: request.params,
        captures,
    })
}

fn decode_announcement(
    schema_uri: &str,
    topic_name: &str,
    payload: &[u8],
) -> Option<ServiceAnnouncement> {
    match topic::split_event_topic(topic_name) {
        Some((_, message::ANNOUNCE_EVENT)) => {}
        _ => return None,
    }

    let request = message::decode_request(payload).ok()?;
    let announcement: ServiceAnnouncement = match request.params_as() {
        Ok(announcement) => announcement,
        Err(e) => {
            tracing::warn!("⚠️  Malformed announcement on {}: {}", topic_name, e);
            return None;
        }
    };

    (announcement.schema_uri == schema_uri).then_some(announcement)
}
