//! Broker client handle (C4's backing connection + the publish contract
//! every Channel, Publisher, and the Forwarder call through)
//!
//! Wraps `async-nats` behind the narrow surface the core actually needs:
//! connect, publish, a JetStream context for the Forwarder's durable
//! consumer and the Event Publisher's last-message lookup, and the
//! Broker Availability Gate fed by connection-event callbacks.

pub mod events;
pub mod gate;
pub mod health;

use crate::error::{IngestError, Result};
use async_nats::jetstream;
use gate::BrokerGate;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The narrow publish contract the Dual Sink depends on. Exists so tests
/// can exercise Dual Sink ordering against a fake without a live NATS
/// server; `BrokerHandle` is the only production implementor.
pub trait Publisher: Send + Sync {
    fn publish(&self, subject: &str, payload: Vec<u8>) -> std::result::Result<(), String>;
}

/// Shared, cloneable handle to one NATS connection. Cloning is cheap —
/// `async_nats::Client` is internally reference-counted.
#[derive(Clone)]
pub struct BrokerHandle {
    client: async_nats::Client,
    gate: Arc<BrokerGate>,
    rt: tokio::runtime::Handle,
}

impl BrokerHandle {
    pub async fn connect(url: &str, max_reconnects: i64, reconnect_wait_sec: u64) -> Result<Self> {
        Self::connect_inner(url, max_reconnects, reconnect_wait_sec, None).await
    }

    pub async fn connect_with_creds(
        url: &str,
        creds_path: Option<&str>,
    ) -> Result<Self> {
        Self::connect_inner(url, -1, 2, creds_path).await
    }

    async fn connect_inner(
        url: &str,
        max_reconnects: i64,
        reconnect_wait_sec: u64,
        creds_path: Option<&str>,
    ) -> Result<Self> {
        let gate = Arc::new(BrokerGate::new());
        let gate_for_cb = gate.clone();

        let mut options = async_nats::ConnectOptions::new()
            .reconnect_delay_callback(move |attempts| {
                Duration::from_secs(reconnect_wait_sec).saturating_mul((attempts as u32).max(1).min(10))
            })
            .event_callback(move |event| {
                let gate = gate_for_cb.clone();
                async move {
                    match event {
                        async_nats::Event::Connected => {
                            info!("broker connected");
                            gate.set_up(true);
                        }
                        async_nats::Event::Disconnected => {
                            warn!("broker disconnected");
                            gate.set_up(false);
                        }
                        _ => {}
                    }
                }
            });

        if max_reconnects >= 0 {
            options = options.max_reconnects(max_reconnects as usize);
        }

        if let Some(path) = creds_path {
            options = options
                .credentials_file(path)
                .await
                .map_err(|e| IngestError::BrokerConnect {
                    url: url.to_string(),
                    reason: e.to_string(),
                })?;
        }

        let client = options
            .connect(url)
            .await
            .map_err(|e| IngestError::BrokerConnect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        gate.set_up(true);

        Ok(Self {
            client,
            gate,
            rt: tokio::runtime::Handle::current(),
        })
    }

    pub fn gate(&self) -> Arc<BrokerGate> {
        self.gate.clone()
    }

    pub async fn publish_async(
        &self,
        subject: &str,
        payload: Vec<u8>,
    ) -> std::result::Result<(), String> {
        self.client
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| e.to_string())
    }

    /// Serial Channels call this from their dedicated OS thread (not a
    /// tokio worker), where blocking directly on the captured runtime
    /// handle is safe. The Event and Health Publishers, and the HTTP
    /// Channel's sink write, call this from a task already running on the
    /// runtime, where a bare `block_on` would panic ("cannot start a
    /// runtime from within a runtime") — `block_in_place` hands the
    /// current worker thread's other tasks off to the pool for the
    /// duration of the blocking wait, which is safe on either thread kind.
    pub fn publish(&self, subject: &str, payload: Vec<u8>) -> std::result::Result<(), String> {
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::task::block_in_place(|| self.rt.block_on(self.publish_async(subject, payload)))
        } else {
            self.rt.block_on(self.publish_async(subject, payload))
        }
    }

    pub async fn flush(&self) -> Result<()> {
        self.client.flush().await.map_err(|_| IngestError::BrokerDisconnected)
    }

    pub fn jetstream(&self) -> jetstream::Context {
        jetstream::new(self.client.clone())
    }

    pub async fn close(&self) {
        let _ = self.client.flush().await;
    }
}

impl Publisher for BrokerHandle {
    fn publish(&self, subject: &str, payload: Vec<u8>) -> std::result::Result<(), String> {
        BrokerHandle::publish(self, subject, payload)
    }
}

#[cfg(test)]
mod tests {
    // BrokerHandle requires a live NATS server to connect, so its
    // construction is exercised only indirectly (through the Gate and
    // DualSink tests, which use a fake publisher). The reconnect delay
    // callback's shape is tested in isolation here.
    use std::time::Duration;

    fn reconnect_delay(attempts: usize, reconnect_wait_sec: u64) -> Duration {
        Duration::from_secs(reconnect_wait_sec).saturating_mul((attempts as u32).max(1).min(10))
    }

    #[test]
    fn reconnect_delay_grows_then_caps() {
        assert_eq!(reconnect_delay(1, 2), Duration::from_secs(2));
        assert_eq!(reconnect_delay(5, 2), Duration::from_secs(10));
        assert_eq!(reconnect_delay(50, 2), Duration::from_secs(20));
    }
}
