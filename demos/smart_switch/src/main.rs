//! Smart switch demo - export a device, discover it, call it and watch its events
//!
//! `demo` runs everything in one process over the memory broker. `serve`
//! and `control` split the two sides across processes over ipmb.

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use topicrpc::{
    service, Bus, BusConfig, Client, EventDelegate, Exporter, IpmbTransport, MemoryBroker,
    MemoryTransport, RequestMeta, Result, SchemaCatalog, SchemaDefinition, Server, Transport,
};
use tracing::{info, warn};

const SWITCH_SCHEMA: &str = "schema://home/on-off";
const SWITCH_TOPIC: &str = "$device/ABCDE/channel/xyz/on-off";
const STATE_ROUTE: &str = "$device/:guid/channel/:cid/on-off/event/state";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SwitchState {
    pub on: bool,
}

/// A relay with one channel
#[derive(Default)]
pub struct SmartSwitch {
    on: AtomicBool,
    events: EventDelegate,
}

#[service(name = "OnOff")]
impl SmartSwitch {
    pub async fn turn_on(&self, _args: ()) -> Result<SwitchState> {
        self.set(true).await
    }

    pub async fn turn_off(&self, _args: ()) -> Result<SwitchState> {
        self.set(false).await
    }

    pub fn get_state(&self, _args: ()) -> Result<SwitchState> {
        Ok(self.state())
    }

    pub async fn toggle(&self, meta: RequestMeta, _args: ()) -> Result<SwitchState> {
        info!("🔀 Toggle requested on {} (id {:?})", meta.topic, meta.id);
        let on = !self.on.load(Ordering::SeqCst);
        self.set(on).await
    }

    #[skip]
    pub fn state(&self) -> SwitchState {
        SwitchState {
            on: self.on.load(Ordering::SeqCst),
        }
    }

    async fn set(&self, on: bool) -> Result<SwitchState> {
        let previous = self.on.swap(on, Ordering::SeqCst);
        let state = self.state();
        if previous != on {
            self.events.send_event("state", &state).await?;
        }
        Ok(state)
    }
}

fn schema_catalog() -> SchemaCatalog {
    SchemaCatalog::new().with_schema(
        SWITCH_SCHEMA,
        SchemaDefinition::new()
            .with_method("TurnOn")
            .with_method("TurnOff")
            .with_method("GetState")
            .with_event("state", ["on"]),
    )
}

#[derive(Parser)]
#[command(name = "smart-switch")]
#[command(about = "Smart switch demo over topicrpc")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run device and controller in one process
    Demo,
    /// Export the switch on an ipmb bus until Ctrl+C
    Serve {
        #[arg(long, default_value = "com.topicrpc.smart-switch")]
        bus: String,
    },
    /// Discover the switch on an ipmb bus and toggle it
    Control {
        #[arg(long, default_value = "com.topicrpc.smart-switch")]
        bus: String,
        #[arg(long, default_value_t = 3)]
        toggles: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    match Cli::parse().command {
        Commands::Demo => run_demo().await,
        Commands::Serve { bus } => run_device(Arc::new(IpmbTransport::new()), &bus).await,
        Commands::Control { bus, toggles } => {
            run_controller(Arc::new(IpmbTransport::new()), &bus, toggles).await
        }
    }
}

async fn connect(transport: Arc<dyn Transport>, address: &str, client_id: &str) -> anyhow::Result<Bus> {
    let config = BusConfig::builder(address)
        .with_client_id(client_id)
        .build()?;
    Bus::connect(transport, config)
        .await
        .with_context(|| format!("connecting {client_id} to {address}"))
}

/// Export the switch, returning it once announced
async fn export_switch(bus: Bus) -> anyhow::Result<Arc<SmartSwitch>> {
    let switch = Arc::new(SmartSwitch::default());
    let exporter = Exporter::new(Server::new(bus), Arc::new(schema_catalog()));
    let exported = exporter
        .export(switch.clone(), SWITCH_TOPIC, SWITCH_SCHEMA)
        .await?;
    switch.events.bind(Arc::new(exported.clone()))?;
    info!(
        "📢 Exported {} on {} with methods {:?}",
        exported.schema_uri(),
        exported.topic(),
        exported.announcement().supported_methods
    );
    Ok(switch)
}

async fn watch_state(client: &Client) -> anyhow::Result<()> {
    client
        .subscribe_events(STATE_ROUTE, |event| async move {
            match event.params_as::<SwitchState>() {
                Ok(state) => info!(
                    "💡 Device {} channel {} is now {}",
                    event.capture("guid").unwrap_or("?"),
                    event.capture("cid").unwrap_or("?"),
                    if state.on { "on" } else { "off" }
                ),
                Err(e) => warn!("⚠️  Unreadable state event on {}: {}", event.topic, e),
            }
        })
        .await?;
    Ok(())
}

async fn run_demo() -> anyhow::Result<()> {
    info!("🚀 Smart switch demo over the memory broker");
    let transport: Arc<dyn Transport> = Arc::new(MemoryTransport::new(Arc::new(MemoryBroker::new())));
    let address = "memory://smart-switch";

    let client = Client::new(connect(transport.clone(), address, "controller").await?);
    let (found_tx, mut found_rx) = mpsc::unbounded_channel();
    client
        .discover(SWITCH_SCHEMA, move |announcement| {
            let found_tx = found_tx.clone();
            async move {
                let _ = found_tx.send(announcement);
            }
        })
        .await?;
    watch_state(&client).await?;

    let switch = export_switch(connect(transport, address, "device").await?).await?;

    let announcement = tokio::time::timeout(Duration::from_secs(2), found_rx.recv())
        .await
        .context("no announcement within 2s")?
        .context("discovery channel closed")?;
    info!("🔍 Discovered {} on {}", announcement.schema_uri, announcement.topic);

    let state: SwitchState = client
        .call_default(&announcement.topic, "turnOn", &())
        .await?;
    info!("✅ turnOn -> {:?}", state);

    let state: SwitchState = client
        .call_default(&announcement.topic, "toggle", &())
        .await?;
    info!("✅ toggle -> {:?}", state);

    let state: SwitchState = client
        .call_default(&announcement.topic, "getState", &())
        .await?;
    info!("✅ getState -> {:?} (device reports {:?})", state, switch.state());

    match client
        .call_default::<_, SwitchState>(&announcement.topic, "dim", &50)
        .await
    {
        Ok(state) => warn!("Unexpected reply to dim: {:?}", state),
        Err(e) => info!("✅ dim rejected as expected: {}", e),
    }

    // Let the last state events drain before exiting
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.bus().close().await?;
    info!("🎉 Demo complete");
    Ok(())
}

async fn run_device(transport: Arc<dyn Transport>, address: &str) -> anyhow::Result<()> {
    let _switch = export_switch(connect(transport, address, "smart-switch-device").await?).await?;
    info!("✅ Device running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("🛑 Received Ctrl+C, shutting down");
    Ok(())
}

async fn run_controller(transport: Arc<dyn Transport>, address: &str, toggles: u32) -> anyhow::Result<()> {
    let client = Client::new(connect(transport, address, "smart-switch-controller").await?);
    watch_state(&client).await?;

    for round in 1..=toggles {
        let state: SwitchState = client.call_default(SWITCH_TOPIC, "toggle", &()).await?;
        info!("🔀 Toggle {}/{} -> {:?}", round, toggles, state);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    client.bus().close().await?;
    Ok(())
}
