//! Bus - pub/sub connection with reconnect and subscription replay
//!
//! The bus wraps one [`Connection`] from a [`Transport`] backend. A reader
//! task pulls inbound messages and routes them to every matching
//! subscription. Each subscription owns a queue drained by its own worker,
//! so callbacks for different subscriptions run concurrently while a slow
//! callback stalls only its own subscription. Routing never waits on a
//! worker; a backlog past `delivery_capacity` is logged.
//!
//! When the session is lost, the reader takes the connection lock
//! exclusively (blocking new publish/subscribe calls), waits the configured
//! backoff, reconnects and replays every registered pattern in registration
//! order. Messages published by peers during the outage are not recovered.

use crate::config::{BusConfig, Qos};
use crate::topic;
use crate::transport::{Connection, Delivery, Transport};
use crate::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Callback invoked with `(topic, payload)` for each matching message
pub type MessageCallback = Arc<dyn Fn(String, Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

struct Subscription {
    pattern: String,
    queue: mpsc::UnboundedSender<Delivery>,
    /// Deliveries queued but not yet handed to the callback
    backlog: Arc<AtomicUsize>,
    worker: JoinHandle<()>,
}

struct BusInner {
    config: BusConfig,
    transport: Arc<dyn Transport>,
    /// Held exclusively for the duration of a reconnect
    connection: RwLock<Arc<dyn Connection>>,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    /// Serializes subscribe calls so a pattern is never listed before its
    /// transport subscribe has settled
    subscribing: tokio::sync::Mutex<()>,
    connected: AtomicBool,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a pub/sub connection; cheap to clone
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("transport", &self.inner.transport.name())
            .field("client_id", &self.inner.config.client_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Bus {
    /// Connect to the backend and start the delivery loop
    pub async fn connect(transport: Arc<dyn Transport>, config: BusConfig) -> Result<Self> {
        config.validate()?;

        let connection: Arc<dyn Connection> = Arc::from(transport.connect(&config).await?);
        tracing::info!(
            "🔌 Connected to {} via {} as {}",
            config.address,
            transport.name(),
            config.client_id
        );

        let inner = Arc::new(BusInner {
            config,
            transport,
            connection: RwLock::new(connection),
            subscriptions: Mutex::new(Vec::new()),
            subscribing: tokio::sync::Mutex::new(()),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        let reader = tokio::spawn(Self::read_loop(Arc::downgrade(&inner)));
        *inner.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(reader);

        Ok(Self { inner })
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Distinct subscribed patterns in registration order
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.patterns()
    }

    /// Publish with the configured default delivery guarantee
    pub async fn publish(&self, topic_name: &str, payload: Vec<u8>) -> Result<()> {
        self.publish_with_qos(topic_name, payload, self.inner.config.default_qos)
            .await
    }

    /// Publish; returns once the transport confirms local hand-off
    pub async fn publish_with_qos(&self, topic_name: &str, payload: Vec<u8>, qos: Qos) -> Result<()> {
        self.ensure_open()?;
        if topic_name.is_empty() || topic_name.contains(['+', '#']) {
            return Err(Error::invalid_topic_pattern(topic_name));
        }

        let connection = self.inner.connection.read().await;
        tracing::debug!("📤 Publishing {} bytes to {}", payload.len(), topic_name);
        connection.publish(topic_name, payload, qos).await
    }

    /// Register `callback` for every message matching `pattern`
    ///
    /// The transport-level subscribe is issued only for the first
    /// registration of an exact pattern string. There is no unsubscribe.
    pub async fn subscribe(&self, pattern: &str, callback: MessageCallback) -> Result<()> {
        topic::validate_pattern(pattern)?;
        self.ensure_open()?;

        let _subscribing = self.inner.subscribing.lock().await;
        let connection = self.inner.connection.read().await;

        let (queue, receiver) = mpsc::unbounded_channel();
        let backlog = Arc::new(AtomicUsize::new(0));
        let worker = tokio::spawn(Self::deliver(
            pattern.to_string(),
            receiver,
            backlog.clone(),
            callback,
        ));
        let subscription = Arc::new(Subscription {
            pattern: pattern.to_string(),
            queue,
            backlog,
            worker,
        });

        let first = {
            let mut subscriptions = self.inner.lock_subscriptions();
            let first = !subscriptions.iter().any(|s| s.pattern == pattern);
            subscriptions.push(subscription.clone());
            first
        };

        if first {
            if let Err(e) = connection.subscribe(pattern).await {
                self.inner
                    .lock_subscriptions()
                    .retain(|s| !Arc::ptr_eq(s, &subscription));
                subscription.worker.abort();
                return Err(e);
            }
            tracing::info!("📬 Subscribed to {}", pattern);
        } else {
            tracing::debug!("📬 Added callback to existing subscription {}", pattern);
        }

        Ok(())
    }

    /// Convenience wrapper around [`Bus::subscribe`] for async closures
    pub async fn subscribe_fn<F, Fut>(&self, pattern: &str, callback: F) -> Result<()>
    where
        F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: MessageCallback =
            Arc::new(move |topic_name, payload| callback(topic_name, payload).boxed());
        self.subscribe(pattern, callback).await
    }

    /// Stop delivery and close the session
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("🛑 Closing bus for {}", self.inner.config.client_id);

        if let Some(reader) = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            reader.abort();
        }
        for subscription in self.inner.lock_subscriptions().iter() {
            subscription.worker.abort();
        }
        self.inner.connected.store(false, Ordering::SeqCst);

        let connection = self.inner.connection.read().await.clone();
        connection.close().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::connection_msg("bus is closed"));
        }
        Ok(())
    }

    async fn read_loop(inner: Weak<BusInner>) {
        loop {
            let connection = match inner.upgrade() {
                Some(bus) if !bus.closed.load(Ordering::SeqCst) => bus.connection.read().await.clone(),
                _ => break,
            };

            let received = connection.recv().await;
            drop(connection);

            let Some(bus) = inner.upgrade() else { break };
            match received {
                Ok(delivery) => bus.route(delivery),
                Err(e) => {
                    if bus.closed.load(Ordering::SeqCst) {
                        break;
                    }
                    tracing::warn!("⚠️  Connection lost for {}: {}", bus.config.client_id, e);
                    bus.reconnect().await;
                }
            }
        }
        tracing::debug!("🔚 Bus read loop ended");
    }

    async fn deliver(
        pattern: String,
        mut queue: mpsc::UnboundedReceiver<Delivery>,
        backlog: Arc<AtomicUsize>,
        callback: MessageCallback,
    ) {
        while let Some(delivery) = queue.recv().await {
            backlog.fetch_sub(1, Ordering::SeqCst);
            let topic_name = delivery.topic.clone();
            let outcome = AssertUnwindSafe(callback(delivery.topic, delivery.payload))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                tracing::error!(
                    "❌ Callback for {} panicked while handling {}",
                    pattern,
                    topic_name
                );
            }
        }
        tracing::debug!("🔚 Delivery worker for {} stopped", pattern);
    }
}

impl BusInner {
    fn lock_subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Arc<Subscription>>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn patterns(&self) -> Vec<String> {
        let subscriptions = self.lock_subscriptions();
        let mut patterns: Vec<String> = Vec::new();
        for subscription in subscriptions.iter() {
            if !patterns.contains(&subscription.pattern) {
                patterns.push(subscription.pattern.clone());
            }
        }
        patterns
    }

    fn route(&self, delivery: Delivery) {
        let targets: Vec<Arc<Subscription>> = self
            .lock_subscriptions()
            .iter()
            .filter(|s| topic::matches(&s.pattern, &delivery.topic))
            .cloned()
            .collect();

        if targets.is_empty() {
            tracing::trace!("No subscription for {}", delivery.topic);
            return;
        }

        for subscription in targets {
            let queued = subscription.backlog.fetch_add(1, Ordering::SeqCst) + 1;
            if subscription.queue.send(delivery.clone()).is_err() {
                subscription.backlog.fetch_sub(1, Ordering::SeqCst);
                tracing::debug!("Delivery worker for {} is gone", subscription.pattern);
                continue;
            }
            if queued == self.config.delivery_capacity + 1 {
                tracing::warn!(
                    "🐢 Subscription {} is more than {} deliveries behind",
                    subscription.pattern,
                    self.config.delivery_capacity
                );
            }
        }
    }

    async fn reconnect(&self) {
        let mut connection = self.connection.write().await;
        self.connected.store(false, Ordering::SeqCst);

        let mut attempt = 0u32;
        while !self.closed.load(Ordering::SeqCst) {
            attempt += 1;
            tokio::time::sleep(self.config.reconnect_backoff).await;

            let fresh: Arc<dyn Connection> = match self.transport.connect(&self.config).await {
                Ok(fresh) => Arc::from(fresh),
                Err(e) => {
                    tracing::warn!("🔁 Reconnect attempt {} failed: {}", attempt, e);
                    continue;
                }
            };

            match self.replay(fresh.as_ref()).await {
                Ok(replayed) => {
                    *connection = fresh;
                    self.connected.store(true, Ordering::SeqCst);
                    tracing::info!(
                        "🔌 Reconnected {} after {} attempt(s), replayed {} subscription(s)",
                        self.config.client_id,
                        attempt,
                        replayed
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!("🔁 Subscription replay failed: {}", e);
                    let _ = fresh.close().await;
                }
            }
        }
    }

    async fn replay(&self, connection: &dyn Connection) -> Result<usize> {
        let patterns = self.patterns();
        for pattern in &patterns {
            connection.subscribe(pattern).await?;
        }
        Ok(patterns.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport_memory::{MemoryBroker, MemoryTransport};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;

    async fn memory_bus(broker: &Arc<MemoryBroker>, client_id: &str) -> Bus {
        memory_bus_with_capacity(broker, client_id, 64).await
    }

    async fn memory_bus_with_capacity(
        broker: &Arc<MemoryBroker>,
        client_id: &str,
        capacity: usize,
    ) -> Bus {
        let config = BusConfig::builder("memory://bus-tests")
            .with_client_id(client_id)
            .with_reconnect_backoff(Duration::from_millis(20))
            .with_delivery_capacity(capacity)
            .build()
            .unwrap();
        Bus::connect(Arc::new(MemoryTransport::new(broker.clone())), config)
            .await
            .unwrap()
    }

    async fn collect(bus: &Bus, pattern: &str) -> UnboundedReceiver<(String, Vec<u8>)> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe_fn(pattern, move |topic_name, payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((topic_name, payload));
            }
        })
        .await
        .unwrap();
        rx
    }

    async fn next(rx: &mut UnboundedReceiver<(String, Vec<u8>)>) -> (String, Vec<u8>) {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("delivery timed out")
            .expect("channel closed")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_publish_reaches_wildcard_subscription() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = memory_bus(&broker, "wild").await;
        let mut rx = collect(&bus, "$device/+/channel/#").await;

        bus.publish("$device/G1/channel/c1/on-off", b"on".to_vec())
            .await
            .unwrap();

        let (topic_name, payload) = next(&mut rx).await;
        assert_eq!(topic_name, "$device/G1/channel/c1/on-off");
        assert_eq!(payload, b"on");
    }

    #[tokio::test]
    async fn test_same_pattern_subscribes_once_at_transport() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = memory_bus(&broker, "dedup").await;
        let mut first = collect(&bus, "a/b").await;
        let mut second = collect(&bus, "a/b").await;

        assert_eq!(bus.subscriptions(), vec!["a/b"]);
        assert_eq!(broker.subscriptions("dedup"), vec!["a/b"]);

        bus.publish("a/b", b"1".to_vec()).await.unwrap();
        next(&mut first).await;
        next(&mut second).await;
    }

    #[tokio::test]
    async fn test_rejects_invalid_patterns_and_topics() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = memory_bus(&broker, "invalid").await;

        let err = bus
            .subscribe_fn("a/#/b", |_, _| async {})
            .await
            .unwrap_err();
        assert_eq!(err.category(), "topic_validation");

        let err = bus.publish("a/+", Vec::new()).await.unwrap_err();
        assert_eq!(err.category(), "topic_validation");
    }

    #[tokio::test]
    async fn test_slow_subscription_does_not_stall_others() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = memory_bus_with_capacity(&broker, "slow", 1).await;

        bus.subscribe_fn("slow/#", |_, _| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        })
        .await
        .unwrap();
        let mut fast = collect(&bus, "fast/#").await;

        // Far more than the slow subscription's capacity
        for n in 0..5 {
            bus.publish(&format!("slow/{n}"), Vec::new()).await.unwrap();
        }
        bus.publish("fast/1", Vec::new()).await.unwrap();
        bus.publish("fast/2", Vec::new()).await.unwrap();

        assert_eq!(next(&mut fast).await.0, "fast/1");
        assert_eq!(next(&mut fast).await.0, "fast/2");
    }

    #[tokio::test]
    async fn test_backlogged_subscription_keeps_its_order() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = memory_bus_with_capacity(&broker, "ordered", 1).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        bus.subscribe_fn("q/#", move |topic_name, _| {
            let tx = tx.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = tx.send(topic_name);
            }
        })
        .await
        .unwrap();

        for n in 0..6 {
            bus.publish(&format!("q/{n}"), Vec::new()).await.unwrap();
        }
        for n in 0..6 {
            let topic_name = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(topic_name, format!("q/{n}"));
        }
    }

    /// Memory transport whose next subscribe fails after a delay
    struct FlakySubscribe {
        inner: MemoryTransport,
        fail_next: Arc<AtomicBool>,
    }

    struct FlakyConnection {
        inner: Box<dyn Connection>,
        fail_next: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl Transport for FlakySubscribe {
        async fn connect(&self, config: &BusConfig) -> Result<Box<dyn Connection>> {
            Ok(Box::new(FlakyConnection {
                inner: self.inner.connect(config).await?,
                fail_next: self.fail_next.clone(),
            }))
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[async_trait::async_trait]
    impl Connection for FlakyConnection {
        async fn publish(&self, topic_name: &str, payload: Vec<u8>, qos: Qos) -> Result<()> {
            self.inner.publish(topic_name, payload, qos).await
        }

        async fn subscribe(&self, pattern: &str) -> Result<()> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(50)).await;
                return Err(Error::transport_msg("subscribe refused"));
            }
            self.inner.subscribe(pattern).await
        }

        async fn recv(&self) -> Result<Delivery> {
            self.inner.recv().await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_failed_subscribe_does_not_strand_concurrent_callback() {
        let broker = Arc::new(MemoryBroker::new());
        let fail_next = Arc::new(AtomicBool::new(true));
        let transport = Arc::new(FlakySubscribe {
            inner: MemoryTransport::new(broker.clone()),
            fail_next: fail_next.clone(),
        });
        let config = BusConfig::builder("memory://bus-tests")
            .with_client_id("flaky-subscribe")
            .build()
            .unwrap();
        let bus = Bus::connect(transport, config).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let first = bus.subscribe_fn("s/#", |_, _| async {});
        let second = bus.subscribe_fn("s/#", move |topic_name, _| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(topic_name);
            }
        });
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap_err().category(), "transport");
        second.unwrap();
        assert_eq!(bus.subscriptions(), vec!["s/#"]);
        assert_eq!(broker.subscriptions("flaky-subscribe"), vec!["s/#"]);

        bus.publish("s/1", Vec::new()).await.unwrap();
        let topic_name = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(topic_name, "s/1");
    }

    #[tokio::test]
    async fn test_panicking_callback_keeps_subscription_alive() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = memory_bus(&broker, "panicky").await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        bus.subscribe_fn("p", move |_, payload| {
            let tx = tx.clone();
            async move {
                if payload == b"boom" {
                    panic!("handler exploded");
                }
                let _ = tx.send(payload);
            }
        })
        .await
        .unwrap();

        bus.publish("p", b"boom".to_vec()).await.unwrap();
        bus.publish("p", b"ok".to_vec()).await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, b"ok");
    }

    #[tokio::test]
    async fn test_reconnect_replays_subscriptions_in_order() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = memory_bus(&broker, "replay").await;
        let peer = memory_bus(&broker, "peer").await;

        let _first = collect(&bus, "z/first").await;
        let mut second = collect(&bus, "a/second/#").await;
        let _third = collect(&bus, "m/+/third").await;

        broker.set_available(false);
        assert!(broker.disconnect("replay"));

        // Lost: nobody is listening for this client during the outage
        peer.publish("a/second/lost", Vec::new()).await.unwrap();

        broker.set_available(true);
        wait_until(|| broker.connect_count() >= 3 && bus.is_connected()).await;

        assert_eq!(
            broker.subscriptions("replay"),
            vec!["z/first", "a/second/#", "m/+/third"]
        );

        peer.publish("a/second/kept", Vec::new()).await.unwrap();
        assert_eq!(next(&mut second).await.0, "a/second/kept");
    }

    #[tokio::test]
    async fn test_close_rejects_further_use() {
        let broker = Arc::new(MemoryBroker::new());
        let bus = memory_bus(&broker, "closing").await;
        bus.close().await.unwrap();

        assert!(!bus.is_connected());
        assert!(!broker.is_connected("closing"));
        assert_eq!(
            bus.publish("x", Vec::new()).await.unwrap_err().category(),
            "connection"
        );
    }
}
