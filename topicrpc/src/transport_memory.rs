//! In-process broker transport
//!
//! The broker is an explicit, application-owned object: every bus created
//! from the same [`MemoryBroker`] shares one topic space. Useful for tests,
//! single-process deployments, and for exercising reconnect behaviour via
//! [`MemoryBroker::disconnect`].

use crate::config::{BusConfig, Qos};
use crate::topic;
use crate::transport::{Connection, Delivery, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

struct Session {
    patterns: Mutex<Vec<String>>,
    sender: mpsc::UnboundedSender<Delivery>,
}

impl Session {
    fn wants(&self, topic_name: &str) -> bool {
        let patterns = self.patterns.lock().unwrap_or_else(|e| e.into_inner());
        patterns.iter().any(|pattern| topic::matches(pattern, topic_name))
    }
}

/// Shared in-memory message broker
pub struct MemoryBroker {
    sessions: DashMap<String, Arc<Session>>,
    available: AtomicBool,
    connects: AtomicUsize,
    routed: AtomicU64,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            available: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            routed: AtomicU64::new(0),
        }
    }

    /// Route a message to every session subscribed to a matching pattern
    fn route(&self, topic_name: &str, payload: &[u8]) -> usize {
        let mut delivered = 0;
        for entry in self.sessions.iter() {
            let session = entry.value();
            if session.wants(topic_name)
                && session
                    .sender
                    .send(Delivery::new(topic_name, payload.to_vec()))
                    .is_ok()
            {
                delivered += 1;
            }
        }
        self.routed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("🚌 Routed {} to {} sessions", topic_name, delivered);
        delivered
    }

    /// Forcibly drop a client's session, as a broker restart or network
    /// failure would
    pub fn disconnect(&self, client_id: &str) -> bool {
        let dropped = self.sessions.remove(client_id).is_some();
        if dropped {
            tracing::info!("🔌 Memory broker dropped session {}", client_id);
        }
        dropped
    }

    /// Toggle whether new sessions are accepted
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.sessions.contains_key(client_id)
    }

    /// Patterns a live session is subscribed to, in subscription order
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.sessions
            .get(client_id)
            .map(|session| {
                session
                    .patterns
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
            })
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Total sessions ever accepted, including reconnects
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Total messages published through the broker
    pub fn routed_count(&self) -> u64 {
        self.routed.load(Ordering::Relaxed)
    }
}

/// Transport that opens sessions on a [`MemoryBroker`]
#[derive(Clone)]
pub struct MemoryTransport {
    broker: Arc<MemoryBroker>,
}

impl MemoryTransport {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, config: &BusConfig) -> Result<Box<dyn Connection>> {
        if !self.broker.available.load(Ordering::SeqCst) {
            return Err(Error::connection_msg(format!(
                "memory broker at {} is unavailable",
                config.address
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            patterns: Mutex::new(Vec::new()),
            sender,
        });
        let handle = Arc::downgrade(&session);

        if self
            .broker
            .sessions
            .insert(config.client_id.clone(), session)
            .is_some()
        {
            tracing::warn!(
                "🔁 Session takeover for client {}, previous session dropped",
                config.client_id
            );
        }
        self.broker.connects.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("🚌 Memory session opened for {}", config.client_id);

        Ok(Box::new(MemoryConnection {
            client_id: config.client_id.clone(),
            broker: self.broker.clone(),
            session: handle,
            receiver: tokio::sync::Mutex::new(receiver),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// One session on a [`MemoryBroker`]
///
/// Only the broker holds the session strongly, so dropping it from the
/// broker closes the delivery channel and fails `recv`.
struct MemoryConnection {
    client_id: String,
    broker: Arc<MemoryBroker>,
    session: Weak<Session>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

impl MemoryConnection {
    fn live_session(&self) -> Result<Arc<Session>> {
        self.session.upgrade().ok_or_else(|| {
            Error::connection_msg(format!("memory session for {} is closed", self.client_id))
        })
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn publish(&self, topic_name: &str, payload: Vec<u8>, _qos: Qos) -> Result<()> {
        self.live_session()?;
        self.broker.route(topic_name, &payload);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<()> {
        let session = self.live_session()?;
        let mut patterns = session.patterns.lock().unwrap_or_else(|e| e.into_inner());
        if !patterns.iter().any(|existing| existing == pattern) {
            patterns.push(pattern.to_string());
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Delivery> {
        let mut receiver = self.receiver.lock().await;
        receiver.recv().await.ok_or_else(|| {
            Error::connection_msg(format!("memory session for {} was dropped", self.client_id))
        })
    }

    async fn close(&self) -> Result<()> {
        let current = self.session.as_ptr();
        self.broker
            .sessions
            .remove_if(&self.client_id, |_, session| Arc::as_ptr(session) == current);
        tracing::debug!("🚌 Memory session closed for {}", self.client_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(client_id: &str) -> BusConfig {
        BusConfig::builder("memory://unit")
            .with_client_id(client_id)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_delivers_only_matching_topics() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = MemoryTransport::new(broker.clone());
        let a = transport.connect(&config("a")).await.unwrap();
        let b = transport.connect(&config("b")).await.unwrap();

        a.subscribe("sensor/+/temp").await.unwrap();
        b.publish("sensor/1/humidity", b"x".to_vec(), Qos::AtMostOnce)
            .await
            .unwrap();
        b.publish("sensor/1/temp", b"21".to_vec(), Qos::AtMostOnce)
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(1), a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivery, Delivery::new("sensor/1/temp", b"21".to_vec()));
        assert_eq!(broker.routed_count(), 2);
    }

    #[tokio::test]
    async fn test_one_delivery_per_session_for_overlapping_patterns() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = MemoryTransport::new(broker.clone());
        let conn = transport.connect(&config("c")).await.unwrap();
        conn.subscribe("a/#").await.unwrap();
        conn.subscribe("a/+").await.unwrap();
        conn.subscribe("a/+").await.unwrap();

        assert_eq!(broker.subscriptions("c"), vec!["a/#", "a/+"]);
        assert_eq!(broker.route("a/b", b"1"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_fails_recv_and_publish() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = MemoryTransport::new(broker.clone());
        let conn = transport.connect(&config("d")).await.unwrap();

        assert!(broker.disconnect("d"));
        assert!(conn.recv().await.is_err());
        assert!(conn
            .publish("x", Vec::new(), Qos::AtMostOnce)
            .await
            .is_err());
        assert!(!broker.is_connected("d"));
    }

    #[tokio::test]
    async fn test_unavailable_broker_rejects_connect() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_available(false);
        let transport = MemoryTransport::new(broker.clone());
        let err = transport.connect(&config("e")).await.err().unwrap();
        assert_eq!(err.category(), "connection");
        assert_eq!(broker.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_close_leaves_newer_session_alone() {
        let broker = Arc::new(MemoryBroker::new());
        let transport = MemoryTransport::new(broker.clone());
        let old = transport.connect(&config("f")).await.unwrap();
        let _new = transport.connect(&config("f")).await.unwrap();

        old.close().await.unwrap();
        assert!(broker.is_connected("f"));
    }
}
