//! Test utilities and helpers for topicrpc integration tests
//!
//! Every environment owns its own memory broker, so tests never share a
//! topic space.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use topicrpc::{
    Bus, BusConfig, Client, Error, MemoryBroker, MemoryTransport, MethodTable, RequestMeta,
    Result, SchemaCatalog, SchemaDefinition, Server, Service,
};

pub const THERMOSTAT_SCHEMA: &str = "schema://home/thermostat";

static TRACING: Once = Once::new();

/// Install a test subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Test environment with one broker and helpers to join it
pub struct TestEnvironment {
    pub broker: Arc<MemoryBroker>,
    pub transport: Arc<MemoryTransport>,
    pub address: String,
}

impl TestEnvironment {
    pub fn new(test_name: &str) -> Self {
        init_tracing();
        let broker = Arc::new(MemoryBroker::new());
        Self {
            transport: Arc::new(MemoryTransport::new(broker.clone())),
            broker,
            address: format!("memory://{test_name}"),
        }
    }

    pub fn config(&self, client_id: &str) -> BusConfig {
        BusConfig::builder(&self.address)
            .with_client_id(client_id)
            .with_reconnect_backoff(Duration::from_millis(20))
            .build()
            .expect("valid test config")
    }

    pub async fn bus(&self, client_id: &str) -> Bus {
        Bus::connect(self.transport.clone(), self.config(client_id))
            .await
            .expect("memory bus connects")
    }

    pub async fn server(&self, client_id: &str) -> Server {
        Server::new(self.bus(client_id).await)
    }

    pub async fn client(&self, client_id: &str) -> Client {
        Client::new(self.bus(client_id).await)
    }

    /// Execute an operation with timeout
    pub async fn with_timeout<F, T>(&self, operation: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        tokio::time::timeout(Duration::from_secs(5), operation)
            .await
            .map_err(|_| Error::runtime_msg("Test operation timed out"))?
    }

    /// Poll until `condition` holds
    pub async fn wait_for(&self, mut condition: impl FnMut() -> bool) -> Result<()> {
        for _ in 0..300 {
            if condition() {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Err(Error::runtime_msg("condition not reached"))
    }
}

/// Receive with a deadline
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("nothing received in time")
        .expect("channel closed")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SetPoint {
    pub celsius: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    pub room: String,
    pub celsius: f64,
    pub caller: Option<u32>,
}

/// Mock thermostat service
pub struct MockThermostat {
    pub room: String,
    pub target: Mutex<f64>,
    pub operation_count: AtomicU64,
    pub delay: Option<Duration>,
}

impl MockThermostat {
    pub fn new(room: &str) -> Self {
        Self {
            room: room.to_string(),
            target: Mutex::new(20.0),
            operation_count: AtomicU64::new(0),
            delay: None,
        }
    }

    /// Configure the service to add delay to operations
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn operations(&self) -> u64 {
        self.operation_count.load(Ordering::SeqCst)
    }

    async fn set_target(&self, args: SetPoint) -> Result<f64> {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if !(5.0..=30.0).contains(&args.celsius) {
            return Err(Error::runtime_msg(format!(
                "{} is outside the 5-30 range",
                args.celsius
            )));
        }
        let mut target = self.target.lock().await;
        let previous = *target;
        *target = args.celsius;
        Ok(previous)
    }

    async fn read(&self, meta: RequestMeta) -> Result<Reading> {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
        Ok(Reading {
            room: self.room.clone(),
            celsius: *self.target.lock().await,
            caller: meta.id,
        })
    }
}

impl Service for MockThermostat {
    fn service_name() -> &'static str {
        "Thermostat"
    }

    fn describe(table: &mut MethodTable<Self>) {
        table
            .method("setTarget", |thermostat: Arc<Self>, args: SetPoint| async move {
                thermostat.set_target(args).await
            })
            .method_with_meta(
                "read",
                |thermostat: Arc<Self>, meta: RequestMeta, _: ()| async move {
                    thermostat.read(meta).await
                },
            );
    }
}

pub fn thermostat_schema() -> SchemaCatalog {
    SchemaCatalog::new().with_schema(
        THERMOSTAT_SCHEMA,
        SchemaDefinition::new()
            .with_method("SetTarget")
            .with_method("Read")
            .with_event("temperature", ["celsius"]),
    )
}
