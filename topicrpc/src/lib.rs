//! # topicrpc - RPC and events over hierarchical pub/sub topics
//!
//! Callers invoke named methods on services addressed by `/`-delimited
//! topics; services answer on `{topic}/reply` and emit notifications on
//! `{topic}/event/{name}`. Everything travels as a versioned JSON envelope
//! over a pluggable pub/sub [`Transport`](transport::Transport).
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use topicrpc::{service, Bus, BusConfig, Client, MemoryBroker, MemoryTransport, Result, Server};
//!
//! pub struct Switch;
//!
//! #[service]
//! impl Switch {
//!     pub async fn turn_on(&self, _args: ()) -> Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let transport = Arc::new(MemoryTransport::new(broker));
//!
//!     let server = Server::new(Bus::connect(transport.clone(), BusConfig::new("memory://demo")).await?);
//!     server
//!         .register_service(Arc::new(Switch), "$device/ABCDE/channel/xyz/on-off")
//!         .await?;
//!
//!     let client = Client::new(Bus::connect(transport, BusConfig::new("memory://demo")).await?);
//!     let () = client
//!         .call_default("$device/ABCDE/channel/xyz/on-off", "turnOn", &())
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Schema-checked export
//!
//! An [`Exporter`] checks a service against the methods its schema
//! declares, serves it, and publishes a one-time
//! [`ServiceAnnouncement`] on `{topic}/event/announce`. Events sent through
//! the returned [`ExportedService`] are validated against the schema.

// Lets `#[service]` expansions name `::topicrpc` from inside this crate
extern crate self as topicrpc;

pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod exporter;
pub mod message;
pub mod server;
pub mod service;
pub mod topic;
pub mod transport;
pub mod transport_memory;

#[cfg(feature = "ipmb")]
pub mod transport_ipmb;



// Re-exports
pub use bus::{Bus, MessageCallback};
pub use client::{Client, EventMessage};
pub use config::{BusConfig, BusConfigBuilder, ClientConfig, Clock, Qos, SystemClock};
pub use error::{Error, Result};
pub use exporter::{
    EventDelegate, EventSink, ExportState, ExportedService, Exporter, SchemaCatalog,
    SchemaDefinition, SchemaValidator,
};
pub use message::{Codec, ErrorCode, Request, Response, RpcError, ServiceAnnouncement};
pub use server::Server;
pub use service::{
    MethodDescriptor, MethodTable, RequestMeta, Service, ServiceDescriptor, ServiceRegistry,
};
pub use transport::{Connection, Delivery, Transport};
pub use transport_memory::{MemoryBroker, MemoryTransport};

#[cfg(feature = "ipmb")]
pub use transport_ipmb::IpmbTransport;

// Re-export macros when feature is enabled
#[cfg(feature = "macros")]
pub use topicrpc_macros::service;

// Re-export commonly used dependencies
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
