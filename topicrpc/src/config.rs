//! Configuration objects passed explicitly into constructors

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Delivery guarantee requested from the transport for a publish
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
}

/// Source of wall-clock timestamps stamped into envelopes
pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the unix epoch
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn default_client_id() -> String {
    format!("topicrpc-{}", uuid::Uuid::new_v4())
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_capacity() -> usize {
    64
}

/// Connection settings for a [`Bus`](crate::bus::Bus)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Backend-specific address (broker URL, ipmb bus name, ...)
    pub address: String,

    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Pause before each reconnect attempt
    #[serde(default = "default_backoff", with = "duration_ms")]
    pub reconnect_backoff: Duration,

    /// Queued deliveries per subscription before a backlog warning is logged
    #[serde(default = "default_capacity")]
    pub delivery_capacity: usize,

    #[serde(default)]
    pub default_qos: Qos,
}

impl BusConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            client_id: default_client_id(),
            reconnect_backoff: default_backoff(),
            delivery_capacity: default_capacity(),
            default_qos: Qos::default(),
        }
    }

    pub fn builder(address: impl Into<String>) -> BusConfigBuilder {
        BusConfigBuilder {
            config: Self::new(address),
        }
    }

    /// Reject settings the bus cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::configuration(
                "address must not be empty",
                Some("address".to_string()),
            ));
        }
        if self.client_id.is_empty() {
            return Err(Error::configuration(
                "client_id must not be empty",
                Some("client_id".to_string()),
            ));
        }
        if self.delivery_capacity == 0 {
            return Err(Error::configuration(
                "delivery_capacity must be at least 1",
                Some("delivery_capacity".to_string()),
            ));
        }
        Ok(())
    }
}

/// Builder for [`BusConfig`]
pub struct BusConfigBuilder {
    config: BusConfig,
}

impl BusConfigBuilder {
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.config.client_id = client_id.into();
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.config.reconnect_backoff = backoff;
        self
    }

    pub fn with_delivery_capacity(mut self, capacity: usize) -> Self {
        self.config.delivery_capacity = capacity;
        self
    }

    pub fn with_default_qos(mut self, qos: Qos) -> Self {
        self.config.default_qos = qos;
        self
    }

    pub fn build(self) -> Result<BusConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Settings for an RPC [`Client`](crate::client::Client)
#[derive(Clone)]
pub struct ClientConfig {
    /// Deadline applied by [`Client::call_default`](crate::client::Client::call_default)
    pub default_timeout: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(5),
            clock: Arc::new(SystemClock),
        }
    }
}

impl ClientConfig {
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}
