//! Integration tests - the `#[service]` macro end to end
//!
//! Services defined with the macro are served over an in-memory broker
//! and called through a real client.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use topicrpc::{
    service, Bus, BusConfig, Client, Error, ErrorCode, MemoryBroker, MemoryTransport, RequestMeta,
    Result, Server, Service, ServiceDescriptor,
};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SetLevel {
    pub level: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LevelReport {
    pub level: u32,
    pub on: bool,
}

#[derive(Default)]
pub struct Dimmer {
    on: AtomicBool,
    level: AtomicU32,
}

#[service]
impl Dimmer {
    pub async fn turn_on(&self, _args: ()) -> Result<()> {
        self.on.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_level(&self, args: SetLevel) -> Result<LevelReport> {
        if args.level > 100 {
            return Err(Error::runtime_msg("level must be at most 100"));
        }
        self.level.store(args.level, Ordering::SeqCst);
        Ok(self.report())
    }

    #[method(name = "whoAmI")]
    pub async fn caller(&self, meta: RequestMeta, _args: ()) -> Result<String> {
        Ok(format!("{}:{}", meta.topic, meta.method))
    }

    #[method]
    async fn hidden_but_exported(&self, value: u32) -> Result<u32> {
        Ok(value * 2)
    }

    #[skip]
    pub fn report(&self) -> LevelReport {
        LevelReport {
            level: self.level.load(Ordering::SeqCst),
            on: self.on.load(Ordering::SeqCst),
        }
    }

    #[allow(dead_code)]
    fn not_exported(&self, _args: ()) -> Result<()> {
        Ok(())
    }

    pub fn new() -> Self {
        Self::default()
    }
}

pub struct Named;

#[service(name = "KitchenLight")]
impl Named {
    pub fn ping(&self, _args: ()) -> Result<&'static str> {
        Ok("pong")
    }
}

async fn pair(name: &str) -> (Server, Client) {
    let broker = Arc::new(MemoryBroker::new());
    let transport = Arc::new(MemoryTransport::new(broker));
    let address = format!("memory://{name}");

    let server_bus = Bus::connect(
        transport.clone(),
        BusConfig::builder(&address)
            .with_client_id(format!("{name}-server"))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();
    let client_bus = Bus::connect(
        transport,
        BusConfig::builder(&address)
            .with_client_id(format!("{name}-client"))
            .build()
            .unwrap(),
    )
    .await
    .unwrap();

    (Server::new(server_bus), Client::new(client_bus))
}

#[test]
fn test_macro_builds_method_table() {
    let descriptor = ServiceDescriptor::introspect(Arc::new(Dimmer::new())).unwrap();
    assert_eq!(descriptor.name, "Dimmer");
    assert_eq!(
        descriptor.method_names(),
        vec!["hiddenButExported", "setLevel", "turnOn", "whoAmI"]
    );
    assert!(descriptor.method("whoAmI").unwrap().takes_meta);
    assert!(!descriptor.method("setLevel").unwrap().takes_meta);

    assert_eq!(<Named as Service>::service_name(), "KitchenLight");
}

#[tokio::test]
async fn test_macro_service_round_trip() {
    let (server, client) = pair("macro-round-trip").await;
    let dimmer = Arc::new(Dimmer::new());
    let topic = "$device/D1/channel/c1/dimmer";
    server.register_service(dimmer.clone(), topic).await.unwrap();

    let timeout = Duration::from_secs(1);
    let () = client
        .call_with_timeout(topic, "turnOn", &(), timeout)
        .await
        .unwrap();
    let report: LevelReport = client
        .call_with_timeout(topic, "setLevel", &SetLevel { level: 42 }, timeout)
        .await
        .unwrap();
    assert_eq!(report, LevelReport { level: 42, on: true });

    let who: String = client
        .call_with_timeout(topic, "whoAmI", &(), timeout)
        .await
        .unwrap();
    assert_eq!(who, format!("{topic}:whoAmI"));

    let doubled: u32 = client
        .call_with_timeout(topic, "hiddenButExported", &21u32, timeout)
        .await
        .unwrap();
    assert_eq!(doubled, 42);
}

#[tokio::test]
async fn test_macro_service_errors_reach_caller() {
    let (server, client) = pair("macro-errors").await;
    let topic = "$device/D2/channel/c1/dimmer";
    server
        .register_service(Arc::new(Dimmer::new()), topic)
        .await
        .unwrap();
    let timeout = Duration::from_secs(1);

    let err = client
        .call_with_timeout::<_, LevelReport>(topic, "setLevel", &SetLevel { level: 400 }, timeout)
        .await
        .unwrap_err();
    match err {
        Error::Remote(remote) => {
            assert_eq!(remote.code, ErrorCode::ServerError);
            assert!(remote.message.contains("at most 100"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    let err = client
        .call_with_timeout::<_, ()>(topic, "report", &(), timeout)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Remote(ref remote) if remote.code == ErrorCode::MethodNotFound));

    let err = client
        .call_with_timeout::<_, ()>(topic, "notExported", &(), timeout)
        .await
        .unwrap_err();
    assert_eq!(err.category(), "remote");
}
