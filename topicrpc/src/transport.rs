//! Transport layer - the seam between the bus and a pub/sub backend
//!
//! A [`Transport`] opens sessions; a [`Connection`] is one live, clean
//! session. The [`Bus`](crate::bus::Bus) owns reconnection and subscription
//! replay, so backends only need to report a lost session by failing
//! [`Connection::recv`].

use crate::config::{BusConfig, Qos};
use crate::Result;
use async_trait::async_trait;

/// An inbound message on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Backend factory for pub/sub sessions
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establish a clean (non-persistent) session
    async fn connect(&self, config: &BusConfig) -> Result<Box<dyn Connection>>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// A live pub/sub session
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Hand a message to the transport; returns once the hand-off is local
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<()>;

    /// Ask the transport to deliver messages matching `pattern`
    async fn subscribe(&self, pattern: &str) -> Result<()>;

    /// Receive the next message; an error means the session is gone
    async fn recv(&self) -> Result<Delivery>;

    /// Close the session
    async fn close(&self) -> Result<()>;
}
