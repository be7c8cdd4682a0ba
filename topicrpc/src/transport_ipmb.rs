//! Cross-process transport over the ipmb message bus
//!
//! ipmb has no notion of topics, so every frame is multicast to all
//! endpoints joined to the bus named by [`BusConfig::address`] and filtered
//! locally against this session's subscription patterns.

use crate::config::{BusConfig, Qos};
use crate::topic;
use crate::transport::{Connection, Delivery, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use type_uuid::TypeUuid;

/// How long a blocking receive waits before re-checking the session
const RECV_POLL: Duration = Duration::from_millis(500);

/// ipmb frame carrying one published message
#[derive(Debug, Serialize, Deserialize, TypeUuid)]
#[uuid = "3f1c9a52-7d0e-4b8a-9c61-52e4a8d0b7f3"]
struct IpmbFrame {
    topic: String,
    payload: Vec<u8>,
}

/// Transport that joins an ipmb bus
#[derive(Debug, Default, Clone, Copy)]
pub struct IpmbTransport;

impl IpmbTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for IpmbTransport {
    async fn connect(&self, config: &BusConfig) -> Result<Box<dyn Connection>> {
        let options = ipmb::Options::new(
            config.address.as_str(),
            ipmb::label!(config.client_id.as_str()),
            "",
        );

        let (sender, receiver) = ipmb::join::<IpmbFrame, IpmbFrame>(options, None)
            .map_err(|e| Error::transport_msg(format!("IPMB join failed: {e}")))?;

        tracing::info!(
            "🚌 Joined IPMB bus {} as {}",
            config.address,
            config.client_id
        );

        Ok(Box::new(IpmbConnection {
            client_id: config.client_id.clone(),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            patterns: Arc::new(Mutex::new(Vec::new())),
        }))
    }

    fn name(&self) -> &'static str {
        "ipmb"
    }
}

struct IpmbConnection {
    client_id: String,
    sender: ipmb::EndpointSender<IpmbFrame>,
    receiver: Arc<Mutex<ipmb::EndpointReceiver<IpmbFrame>>>,
    patterns: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Connection for IpmbConnection {
    async fn publish(&self, topic_name: &str, payload: Vec<u8>, _qos: Qos) -> Result<()> {
        let frame = IpmbFrame {
            topic: topic_name.to_string(),
            payload,
        };
        let selector = ipmb::Selector::multicast(ipmb::LabelOp::True);

        self.sender
            .send(ipmb::Message::new(selector, frame))
            .map_err(|e| Error::transport_msg(format!("IPMB send failed: {e}")))?;
        tracing::debug!("📤 Sent IPMB frame on {}", topic_name);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<()> {
        let mut patterns = self.patterns.lock().unwrap_or_else(|e| e.into_inner());
        if !patterns.iter().any(|existing| existing == pattern) {
            patterns.push(pattern.to_string());
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Delivery> {
        loop {
            let receiver = self.receiver.clone();
            let patterns = self.patterns.clone();

            let received = tokio::task::spawn_blocking(move || {
                let mut receiver = receiver.lock().unwrap_or_else(|e| e.into_inner());
                match receiver.recv(Some(RECV_POLL)) {
                    Ok(message) => {
                        let frame = message.payload;
                        let patterns = patterns.lock().unwrap_or_else(|e| e.into_inner());
                        let wanted = patterns
                            .iter()
                            .any(|pattern| topic::matches(pattern, &frame.topic));
                        Ok(wanted.then(|| Delivery::new(frame.topic, frame.payload)))
                    }
                    Err(e) => {
                        let error_msg = e.to_string();
                        // Idle polls surface as timeouts, not lost sessions
                        if error_msg.to_lowercase().contains("timeout") {
                            Ok(None)
                        } else {
                            Err(Error::transport_msg(format!("IPMB recv failed: {error_msg}")))
                        }
                    }
                }
            })
            .await
            .map_err(|e| Error::runtime("async recv failed", e))??;

            if let Some(delivery) = received {
                return Ok(delivery);
            }
        }
    }

    async fn close(&self) -> Result<()> {
        // IPMB handles cleanup automatically
        tracing::info!("🚌 Closing IPMB session for {}", self.client_id);
        Ok(())
    }
}
