//! Schema-checked service export
//!
//! Export cross-checks the methods a schema declares against the methods a
//! service actually registers, starts serving it, then publishes a one-time
//! [`ServiceAnnouncement`] on `{topic}/event/announce`.
//!
//! Outgoing events declared by the schema are validated first. Violations
//! block the publish; a validator that fails to answer is only logged and
//! the event goes out anyway.

use crate::bus::Bus;
use crate::config::Qos;
use crate::message::{self, Codec, ServiceAnnouncement, ANNOUNCE_EVENT};
use crate::server::Server;
use crate::service::{Service, ServiceDescriptor};
use crate::topic;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

/// External JSON-Schema collaborator
#[async_trait]
pub trait SchemaValidator: Send + Sync + 'static {
    /// Validate `value` against the schema at `schema_uri`; returns the
    /// violations, empty when valid
    async fn validate(&self, schema_uri: &str, value: &Value) -> Result<Vec<String>>;

    /// Method names the schema declares
    async fn declared_methods(&self, schema_uri: &str) -> Result<Vec<String>>;

    /// Event names the schema declares
    async fn declared_events(&self, schema_uri: &str) -> Result<Vec<String>>;
}

/// URI of the value subschema for event `name`
pub fn event_schema_uri(schema_uri: &str, name: &str) -> String {
    format!("{schema_uri}#/events/{name}/value")
}

/// Declared surface of one schema in a [`SchemaCatalog`]
#[derive(Debug, Clone, Default)]
pub struct SchemaDefinition {
    pub methods: Vec<String>,
    /// Event name to the fields its value must carry
    pub events: HashMap<String, Vec<String>>,
}

impl SchemaDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method(mut self, name: impl Into<String>) -> Self {
        self.methods.push(name.into());
        self
    }

    pub fn with_event<I, F>(mut self, name: impl Into<String>, required: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<String>,
    {
        self.events
            .insert(name.into(), required.into_iter().map(Into::into).collect());
        self
    }
}

/// In-memory [`SchemaValidator`] holding declared names and required
/// event fields
#[derive(Debug, Default)]
pub struct SchemaCatalog {
    schemas: HashMap<String, SchemaDefinition>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schema(mut self, schema_uri: impl Into<String>, definition: SchemaDefinition) -> Self {
        self.schemas.insert(schema_uri.into(), definition);
        self
    }

    fn definition(&self, schema_uri: &str) -> Result<&SchemaDefinition> {
        self.schemas
            .get(schema_uri)
            .ok_or_else(|| Error::schema_msg(format!("unknown schema {schema_uri}")))
    }
}

#[async_trait]
impl SchemaValidator for SchemaCatalog {
    async fn validate(&self, schema_uri: &str, value: &Value) -> Result<Vec<String>> {
        let (schema, fragment) = schema_uri
            .split_once('#')
            .ok_or_else(|| Error::schema_msg(format!("{schema_uri} names no subschema")))?;
        let event = fragment
            .strip_prefix("/events/")
            .and_then(|rest| rest.strip_suffix("/value"))
            .ok_or_else(|| Error::schema_msg(format!("unsupported subschema {fragment}")))?;

        let required = self
            .definition(schema)?
            .events
            .get(event)
            .ok_or_else(|| Error::schema_msg(format!("{schema} declares no event {event}")))?;

        if required.is_empty() {
            return Ok(Vec::new());
        }
        let Some(object) = value.as_object() else {
            return Ok(vec![format!("{event}: expected an object")]);
        };
        Ok(required
            .iter()
            .filter(|field| !object.contains_key(field.as_str()))
            .map(|field| format!("{event}: missing required field '{field}'"))
            .collect())
    }

    async fn declared_methods(&self, schema_uri: &str) -> Result<Vec<String>> {
        Ok(self.definition(schema_uri)?.methods.clone())
    }

    async fn declared_events(&self, schema_uri: &str) -> Result<Vec<String>> {
        let mut events: Vec<String> = self.definition(schema_uri)?.events.keys().cloned().collect();
        events.sort();
        Ok(events)
    }
}

/// Lifecycle of one export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportState {
    Unregistered,
    /// Serving requests, announcement not yet confirmed
    Subscribed,
    /// Terminal; announcing again takes a fresh export
    Announced,
}

/// Exports services after checking them against their schema
#[derive(Clone)]
pub struct Exporter {
    server: Server,
    validator: Arc<dyn SchemaValidator>,
}

impl Exporter {
    pub fn new(server: Server, validator: Arc<dyn SchemaValidator>) -> Self {
        Self { server, validator }
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Export `receiver` on `topic` under `schema_uri`
    ///
    /// Fails with [`Error::SchemaMismatch`] when the schema declares a
    /// method the service does not register. Extra registered methods are
    /// served and announced as-is. If the announcement cannot be published
    /// the topic is unregistered again and the export can be retried.
    pub async fn export<S: Service>(
        &self,
        receiver: Arc<S>,
        topic_name: &str,
        schema_uri: &str,
    ) -> Result<ExportedService> {
        let descriptor = ServiceDescriptor::introspect(receiver)?;
        let actual = descriptor.method_names();

        let mut missing: Vec<String> = self
            .validator
            .declared_methods(schema_uri)
            .await?
            .iter()
            .map(|name| message::from_wire_method(name))
            .filter(|name| !actual.contains(name))
            .collect();
        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(Error::schema_mismatch(schema_uri, topic_name, missing));
        }

        let supported_events = self.validator.declared_events(schema_uri).await?;
        let descriptor = self.server.register_descriptor(descriptor, topic_name).await?;

        let exported = ExportedService {
            inner: Arc::new(ExportedInner {
                topic: topic_name.to_string(),
                schema_uri: schema_uri.to_string(),
                supported_methods: descriptor.method_names(),
                supported_events,
                bus: self.server.bus().clone(),
                codec: self.server.codec().clone(),
                validator: self.validator.clone(),
                state: Mutex::new(ExportState::Subscribed),
            }),
        };

        if let Err(e) = exported.announce().await {
            tracing::warn!("⚠️  Announcing {} failed, unregistering: {}", topic_name, e);
            self.server.registry().unregister(topic_name);
            return Err(e);
        }
        Ok(exported)
    }
}

struct ExportedInner {
    topic: String,
    schema_uri: String,
    supported_methods: Vec<String>,
    supported_events: Vec<String>,
    bus: Bus,
    codec: Codec,
    validator: Arc<dyn SchemaValidator>,
    state: Mutex<ExportState>,
}

/// Handle to an exported service; cheap to clone
#[derive(Clone)]
pub struct ExportedService {
    inner: Arc<ExportedInner>,
}

impl std::fmt::Debug for ExportedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedService")
            .field("topic", &self.inner.topic)
            .field("schema", &self.inner.schema_uri)
            .field("state", &self.state())
            .finish()
    }
}

impl ExportedService {
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn schema_uri(&self) -> &str {
        &self.inner.schema_uri
    }

    pub fn state(&self) -> ExportState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn announcement(&self) -> ServiceAnnouncement {
        ServiceAnnouncement {
            schema_uri: self.inner.schema_uri.clone(),
            topic: self.inner.topic.clone(),
            supported_methods: self.inner.supported_methods.clone(),
            supported_events: self.inner.supported_events.clone(),
        }
    }

    async fn announce(&self) -> Result<()> {
        if self.state() != ExportState::Subscribed {
            return Ok(());
        }

        let params = serde_json::to_value(self.announcement())?;
        let payload = self
            .inner
            .codec
            .encode_notification(ANNOUNCE_EVENT, Some(&params))?;
        let announce = topic::announce_topic(&self.inner.topic);

        self.inner
            .bus
            .publish_with_qos(&announce, payload, Qos::AtLeastOnce)
            .await?;

        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = ExportState::Announced;
        tracing::info!(
            "📢 Announced {} on {} methods={:?}",
            self.inner.schema_uri,
            announce,
            self.inner.supported_methods
        );
        Ok(())
    }

    /// Publish event `name` on `{topic}/event/{name}`
    pub async fn send_event<T: Serialize>(&self, name: &str, payload: &T) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        self.send_event_value(name, value).await
    }

    pub async fn send_event_value(&self, name: &str, value: Value) -> Result<()> {
        if self.inner.supported_events.iter().any(|event| event == name) {
            let uri = event_schema_uri(&self.inner.schema_uri, name);
            match self.inner.validator.validate(&uri, &value).await {
                Ok(violations) if !violations.is_empty() => {
                    tracing::warn!("🚫 Event {} rejected: {:?}", name, violations);
                    return Err(Error::validation(name, violations));
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("⚠️  Could not validate event {}, publishing anyway: {}", name, e);
                }
            }
        }

        let params = message::params_from_value(value);
        let payload = self.inner.codec.encode_notification(name, params.as_ref())?;
        let event = topic::event_topic(&self.inner.topic, name);

        tracing::debug!("📤 Event {} on {}", name, event);
        self.inner.bus.publish(&event, payload).await
    }
}

/// Narrow capability for emitting events
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn emit(&self, name: &str, payload: Value) -> Result<()>;
}

#[async_trait]
impl EventSink for ExportedService {
    async fn emit(&self, name: &str, payload: Value) -> Result<()> {
        self.send_event_value(name, payload).await
    }
}

/// Event emitter a service holds as a field and binds once exported
#[derive(Default)]
pub struct EventDelegate {
    sink: OnceLock<Arc<dyn EventSink>>,
}

impl std::fmt::Debug for EventDelegate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDelegate")
            .field("bound", &self.is_bound())
            .finish()
    }
}

impl EventDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the sink; a delegate binds at most once
    pub fn bind(&self, sink: Arc<dyn EventSink>) -> Result<()> {
        self.sink
            .set(sink)
            .map_err(|_| Error::runtime_msg("event delegate is already bound"))
    }

    pub fn is_bound(&self) -> bool {
        self.sink.get().is_some()
    }

    pub async fn send_event<T: Serialize>(&self, name: &str, payload: &T) -> Result<()> {
        let sink = self
            .sink
            .get()
            .ok_or_else(|| Error::runtime_msg(format!("cannot send {name}: service is not exported")))?;
        sink.emit(name, serde_json::to_value(payload)?).await
    }
}
