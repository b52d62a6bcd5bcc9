//! Remote Forwarder (C8)
//!
//! Drains every record landed on the local broker's durable stream and
//! republishes it to a second, remote NATS broker — the path a site takes
//! to mirror its CDR stream upstream without letting a remote outage touch
//! ingest. A pull consumer with `max_ack_pending` pinned to one message
//! keeps the local and remote streams in lockstep: nothing is acked
//! locally until the remote publish (and its own broker ack) succeeds.

use crate::broker::gate::AwaitOutcome;
use crate::broker::BrokerHandle;
use crate::config::ForwarderConfig;
use crate::constants::{FORWARDER_ACK_WAIT, FORWARDER_DOWN_RETRY_DELAY, FORWARDER_FETCH_WAIT, FORWARDER_MAX_ACK_PENDING};
use crate::error::{IngestError, Result};
use async_nats::jetstream::{self, consumer::pull::Config as PullConfig};
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Forwarder {
    consumer: jetstream::consumer::Consumer<PullConfig>,
    remote: BrokerHandle,
    remote_subject_override: Option<String>,
}

impl Forwarder {
    /// Attach a durable pull consumer, named `{instance}-forwarder`, to the
    /// already-existing local `cdr` stream (created by the Supervisor
    /// before this is called — see spec.md §6's three named streams), and
    /// connect to the remote broker. Idempotent — safe to call on every
    /// restart.
    pub async fn connect(
        local_js: jetstream::Context,
        stream_name: &str,
        consumer_name: &str,
        cfg: &ForwarderConfig,
    ) -> Result<Self> {
        let remote_url = cfg.remote_url.as_deref().ok_or_else(|| IngestError::ConfigValidation {
            field: "forwarder.remote_url".to_string(),
            reason: "required when forwarder.enabled = true".to_string(),
        })?;

        let stream = local_js.get_stream(stream_name).await.map_err(|e| IngestError::BrokerConnect {
            url: "local".to_string(),
            reason: e.to_string(),
        })?;

        let consumer = stream
            .get_or_create_consumer(
                consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(consumer_name.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ack_wait: FORWARDER_ACK_WAIT,
                    max_ack_pending: FORWARDER_MAX_ACK_PENDING,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| IngestError::BrokerConnect {
                url: "local".to_string(),
                reason: e.to_string(),
            })?;

        let remote = BrokerHandle::connect_with_creds(remote_url, cfg.remote_creds.as_deref()).await?;

        Ok(Self {
            consumer,
            remote,
            remote_subject_override: cfg.remote_subject.clone(),
        })
    }

    /// Fetch-ack-forward loop. When the remote gate is down, parks rather
    /// than fetching — an unacked message stays claimed by this consumer
    /// until its ack_wait elapses, so parking avoids needlessly cycling
    /// redeliveries while the remote is unreachable.
    pub async fn run(&self, cancel: CancellationToken) {
        let gate = self.remote.gate();
        loop {
            if cancel.is_cancelled() {
                return;
            }

            if !gate.is_up() {
                match gate.await_up(&cancel).await {
                    AwaitOutcome::Cancelled => return,
                    AwaitOutcome::Up => {}
                }
            }

            let mut messages = match self
                .consumer
                .fetch()
                .max_messages(1)
                .expires(FORWARDER_FETCH_WAIT)
                .messages()
                .await
            {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "forwarder fetch failed");
                    tokio::time::sleep(FORWARDER_DOWN_RETRY_DELAY).await;
                    continue;
                }
            };

            let Some(next) = messages.next().await else {
                continue;
            };
            let message = match next {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "forwarder message pull failed");
                    continue;
                }
            };

            let remote_subject = self
                .remote_subject_override
                .clone()
                .unwrap_or_else(|| message.subject.to_string());

            let publish_result = match self.remote.publish_async(&remote_subject, message.payload.to_vec()).await {
                Ok(()) => self.remote.flush().await.map_err(|e| e.to_string()),
                Err(reason) => Err(reason),
            };

            match publish_result {
                Ok(()) => {
                    if let Err(e) = message.ack().await {
                        error!(error = ?e, "forwarder ack failed after successful remote publish");
                    }
                }
                Err(reason) => {
                    warn!(subject = %remote_subject, %reason, "forwarder remote publish failed, leaving message unacked");
                    let _ = message
                        .ack_with(jetstream::AckKind::Nak(Some(FORWARDER_DOWN_RETRY_DELAY)))
                        .await;
                    tokio::time::sleep(FORWARDER_DOWN_RETRY_DELAY).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarder_requires_remote_url_when_enabled() {
        let cfg = ForwarderConfig {
            enabled: true,
            remote_url: None,
            remote_subject: None,
            remote_creds: None,
        };
        assert!(cfg.remote_url.is_none());
    }

    #[test]
    fn ack_pending_is_one_to_preserve_ordering() {
        assert_eq!(FORWARDER_MAX_ACK_PENDING, 1);
    }
}
