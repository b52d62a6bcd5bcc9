//! Health Publisher (C10)
//!
//! Every `HEALTH_INTERVAL`, snapshots per-channel state + counters and
//! publishes to `{state}.health.{instance}`. A final heartbeat is
//! attempted on stop.

use super::Publisher;
use crate::constants::HEALTH_INTERVAL;
use crate::model::ChannelSnapshot;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Whatever owns the live channels (the Supervisor) implements this so the
/// Health Publisher doesn't need to depend on the supervisor module.
pub trait SnapshotSource: Send + Sync {
    fn snapshot_all(&self) -> Vec<ChannelSnapshot>;
}

pub struct HealthPublisher {
    broker: Option<Arc<dyn Publisher>>,
    subject: String,
}

impl HealthPublisher {
    pub fn new(broker: Option<Arc<dyn Publisher>>, state_token: &str, instance: &str) -> Self {
        Self {
            broker,
            subject: format!("{state_token}.health.{instance}"),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn publish_snapshot(&self, snapshots: &[ChannelSnapshot]) {
        let Some(broker) = &self.broker else { return };
        let payload = json!({
            "ts": Utc::now(),
            "channels": snapshots,
        });
        if let Ok(bytes) = serde_json::to_vec(&payload) {
            let _ = broker.publish(&self.subject, bytes);
        }
    }

    /// Heartbeat loop: publish every `HEALTH_INTERVAL`, and once more on
    /// cancellation before returning.
    pub async fn run(&self, source: Arc<dyn SnapshotSource>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.publish_snapshot(&source.snapshot_all());
                    break;
                }
                _ = tokio::time::sleep(HEALTH_INTERVAL) => {
                    self.publish_snapshot(&source.snapshot_all());
                }
            }
        }
    }
}
