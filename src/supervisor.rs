//! Channel Supervisor (C7)
//!
//! Owns every configured port's channel, the shared broker connection and
//! Availability Gate, the Event and Health Publishers, and (when enabled)
//! the Remote Forwarder. Also the dynamic add/enable/disable/delete/update
//! surface spec.md gives an operator for reconfiguring ports without a
//! restart.
//!
//! HTTP ports sharing a `listen_port` are served by one axum instance, so
//! adding or removing an HTTP port rebuilds that port's whole listener;
//! Serial ports are fully independent and each owns one OS thread, so
//! Serial add/remove only ever touches the one affected channel.

use crate::broker::events::EventPublisher;
use crate::broker::gate::BrokerGate;
use crate::broker::health::{HealthPublisher, SnapshotSource};
use crate::broker::{BrokerHandle, Publisher};
use crate::config::Config;
use crate::constants::SHUTDOWN_BUDGET;
use crate::error::{IngestError, Result};
use crate::forwarder::Forwarder;
use crate::http::{group_by_listen_port, HttpChannel, HttpRoute};
use crate::model::{derive_sink_descriptor, state_token, ChannelSnapshot, ChannelState, ChannelStats, PortKind, PortSpec};
use crate::serial::channel::SerialChannel;
use crate::sink::DualSink;
use async_nats::jetstream;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct HttpRouteEntry {
    listen_port: u16,
    url_path: String,
    designation: String,
    fips: String,
    sink: Arc<DualSink>,
    stats: Arc<Mutex<ChannelStats>>,
}

pub struct Supervisor {
    config: Mutex<Config>,
    broker: Option<Arc<BrokerHandle>>,
    gate: Arc<BrokerGate>,
    events: EventPublisher,
    health: Arc<HealthPublisher>,
    cancel: CancellationToken,

    serial_channels: Mutex<HashMap<String, SerialChannel>>,
    http_channels: Mutex<HashMap<u16, HttpChannel>>,
    http_routes: Mutex<Vec<HttpRouteEntry>>,
    forwarder_cancel: Mutex<Option<CancellationToken>>,
}

impl Supervisor {
    pub async fn new(config: Config) -> Result<Self> {
        let instance = config.app.instance_id.clone();
        let state = state_token(&config.nats.subject_prefix).to_string();

        let broker = if !config.ports.is_empty() || config.forwarder.enabled {
            Some(Arc::new(
                BrokerHandle::connect(&config.nats.url, config.nats.max_reconnects, config.nats.reconnect_wait_sec).await?,
            ))
        } else {
            None
        };

        let gate = broker
            .as_ref()
            .map(|b| b.gate())
            .unwrap_or_else(|| Arc::new(BrokerGate::new()));

        let publisher: Option<Arc<dyn Publisher>> = broker.clone().map(|b| b as Arc<dyn Publisher>);
        let events = EventPublisher::new(publisher.clone(), &state, &instance);
        let health = Arc::new(HealthPublisher::new(publisher, &state, &instance));

        Ok(Self {
            config: Mutex::new(config),
            broker,
            gate,
            events,
            health,
            cancel: CancellationToken::new(),
            serial_channels: Mutex::new(HashMap::new()),
            http_channels: Mutex::new(HashMap::new()),
            http_routes: Mutex::new(Vec::new()),
            forwarder_cancel: Mutex::new(None),
        })
    }

    /// Bring up every enabled configured port, announce startup (including
    /// an `unclean_shutdown` event if the prior run didn't exit cleanly),
    /// and start the Health Publisher and, if configured, the Forwarder.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let config = self.config.lock().clone();

        self.ensure_broker_streams(&config).await?;

        let js = self.broker.as_ref().map(|b| b.jetstream());
        self.events.check_unclean_shutdown_and_announce_start(js.clone()).await;

        let serial_specs: Vec<PortSpec> = config
            .ports
            .iter()
            .filter(|p| p.enabled && p.kind == PortKind::Serial)
            .cloned()
            .collect();
        for spec in serial_specs {
            self.start_serial_channel(&config, spec)?;
        }

        let http_specs: Vec<PortSpec> = config
            .ports
            .iter()
            .filter(|p| p.enabled && p.kind == PortKind::Http)
            .cloned()
            .collect();
        if !http_specs.is_empty() {
            self.start_http_channels(&config, http_specs).await?;
        }

        if self.serial_channels.lock().is_empty() && self.http_channels.lock().is_empty() {
            return Err(IngestError::NoChannelsStarted);
        }

        let health = self.health.clone();
        let health_source: Arc<dyn SnapshotSource> = self.clone();
        let health_cancel = self.cancel.clone();
        tokio::spawn(async move {
            health.run(health_source, health_cancel).await;
        });

        if config.forwarder.enabled {
            if let Some(broker) = &self.broker {
                let js = broker.jetstream();
                let consumer_name = format!("{}-forwarder", config.app.instance_id);
                match Forwarder::connect(js, "cdr", &consumer_name, &config.forwarder).await {
                    Ok(forwarder) => {
                        let forwarder_cancel = CancellationToken::new();
                        *self.forwarder_cancel.lock() = Some(forwarder_cancel.clone());
                        tokio::spawn(async move {
                            forwarder.run(forwarder_cancel).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "forwarder failed to start, continuing without it"),
                }
            }
        }

        Ok(())
    }

    /// Create the three logical streams spec.md §6 names — `cdr`, `health`,
    /// `events` — before anything publishes or reads from them. `cdr`'s
    /// subject list is the exact, already-resolved CDR subject of every
    /// enabled port (not a `{prefix}.>` wildcard): `{state}.health.{instance}`
    /// and `{state}.events.{instance}` share `{prefix}`'s first token as
    /// their own root, so a wildcard `cdr` stream would silently capture
    /// health/event traffic too (and the Forwarder would republish it to the
    /// remote broker as if it were a CDR record).
    async fn ensure_broker_streams(&self, config: &Config) -> Result<()> {
        let Some(broker) = &self.broker else { return Ok(()) };
        let js = broker.jetstream();
        let state = state_token(&config.nats.subject_prefix).to_string();

        let mut cdr_subjects: Vec<String> = config
            .ports
            .iter()
            .filter(|p| p.enabled)
            .map(|p| derive_sink_descriptor(&config.logging.base_path, &config.nats.subject_prefix, p).subject)
            .collect();
        cdr_subjects.sort();
        cdr_subjects.dedup();
        if cdr_subjects.is_empty() {
            cdr_subjects.push(format!("{}.>", config.nats.subject_prefix));
        }

        for (name, subjects) in [
            ("cdr", cdr_subjects),
            ("health", vec![format!("{state}.health.>")]),
            ("events", vec![format!("{state}.events.>")]),
        ] {
            js.get_or_create_stream(jetstream::stream::Config {
                name: name.to_string(),
                subjects,
                ..Default::default()
            })
            .await
            .map_err(|e| IngestError::BrokerConnect {
                url: "local".to_string(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    fn sink_for(&self, config: &Config, spec: &PortSpec) -> Result<Arc<DualSink>> {
        let descriptor = derive_sink_descriptor(&config.logging.base_path, &config.nats.subject_prefix, spec);
        let publisher: Arc<dyn Publisher> = match &self.broker {
            Some(b) => b.clone(),
            None => Arc::new(NullPublisher),
        };
        Ok(Arc::new(DualSink::new(
            descriptor.file_path,
            descriptor.subject,
            publisher,
            config.logging.max_size_mb,
            config.logging.max_backups,
            config.logging.compress,
        )?))
    }

    fn start_serial_channel(&self, config: &Config, spec: PortSpec) -> Result<()> {
        let id = spec.identifier().to_string();
        if self.serial_channels.lock().contains_key(&id) {
            return Err(IngestError::DuplicatePort {
                field: "device",
                value: id,
            });
        }
        let sink = self.sink_for(config, &spec)?;
        let channel = SerialChannel::spawn(
            spec,
            config.detection.clone(),
            config.recovery.clone(),
            sink,
            self.gate.clone(),
            self.events.clone(),
        );
        self.serial_channels.lock().insert(id, channel);
        Ok(())
    }

    async fn start_http_channels(&self, config: &Config, specs: Vec<PortSpec>) -> Result<()> {
        let mut routes = Vec::new();
        let mut ports = Vec::new();
        let mut entries = Vec::new();

        for spec in &specs {
            let sink = self.sink_for(config, spec)?;
            let fips = spec.fips.clone().unwrap_or_default();
            let stats = Arc::new(Mutex::new(ChannelStats::new(ChannelState::Running)));
            entries.push(HttpRouteEntry {
                listen_port: spec.listen_port,
                url_path: spec.url_path.clone(),
                designation: spec.designation.clone(),
                fips: fips.clone(),
                sink: sink.clone(),
                stats: stats.clone(),
            });
            routes.push(HttpRoute {
                url_path: spec.url_path.clone(),
                designation: spec.designation.clone(),
                fips,
                sink,
                stats,
            });
            ports.push(spec.listen_port);
        }

        let grouped = group_by_listen_port(routes, &ports);
        for (listen_port, group_routes) in grouped {
            let channel = HttpChannel::spawn(listen_port, group_routes, self.events.clone()).await?;
            self.http_channels.lock().insert(listen_port, channel);
        }
        self.http_routes.lock().extend(entries);
        Ok(())
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(forwarder_cancel) = self.forwarder_cancel.lock().take() {
            forwarder_cancel.cancel();
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_BUDGET;

        let designations: Vec<String> = self.serial_channels.lock().keys().cloned().collect();
        for id in designations {
            if let Some(mut channel) = self.serial_channels.lock().remove(&id) {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let _ = tokio::time::timeout(remaining, tokio::task::spawn_blocking(move || channel.stop())).await;
            }
        }

        let ports: Vec<u16> = self.http_channels.lock().keys().cloned().collect();
        for port in ports {
            if let Some(mut channel) = self.http_channels.lock().remove(&port) {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                let _ = tokio::time::timeout(remaining, channel.stop()).await;
            }
        }

        self.events.publish(crate::broker::events::EventType::ServiceStop, None, None, None, None);
        if let Some(broker) = &self.broker {
            broker.close().await;
        }
    }

    // === Dynamic port management ===
    //
    // Serial ports are independent OS threads, so add/enable/disable/delete
    // only ever touch the one affected channel. HTTP ports sharing a
    // `listen_port` are served by a single axum instance, so any add/remove
    // of an HTTP port tears down and rebuilds that whole listener from the
    // surviving enabled routes on that port.

    pub async fn add_port(self: &Arc<Self>, spec: PortSpec) -> Result<()> {
        let id = spec.identifier().to_string();
        if self.config.lock().ports.iter().any(|p| p.identifier() == id) {
            return Err(IngestError::DuplicatePort {
                field: "identifier",
                value: id,
            });
        }
        self.config.lock().ports.push(spec.clone());
        if spec.enabled {
            if let Err(e) = self.bring_up(&spec).await {
                self.config.lock().ports.retain(|p| p.identifier() != id);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Bring up a single enabled port's channel — the shared path used by
    /// both `add_port` and `enable_port`.
    async fn bring_up(self: &Arc<Self>, spec: &PortSpec) -> Result<()> {
        let config = self.config.lock().clone();
        match spec.kind {
            PortKind::Serial => self.start_serial_channel(&config, spec.clone()),
            PortKind::Http => self.rebuild_http_listener(&config, spec.listen_port).await,
        }
    }

    /// Tear down and rebuild the axum listener for `listen_port` from every
    /// currently-enabled configured route on that port, plus whichever of
    /// `self.http_routes`' prior entries on other ports are unaffected.
    async fn rebuild_http_listener(&self, config: &Config, listen_port: u16) -> Result<()> {
        if let Some(mut channel) = self.http_channels.lock().remove(&listen_port) {
            channel.stop().await;
        }
        self.http_routes.lock().retain(|e| e.listen_port != listen_port);

        let specs: Vec<PortSpec> = config
            .ports
            .iter()
            .filter(|p| p.enabled && p.kind == PortKind::Http && p.listen_port == listen_port)
            .cloned()
            .collect();
        if specs.is_empty() {
            return Ok(());
        }
        self.start_http_channels(config, specs).await
    }

    pub async fn enable_port(self: &Arc<Self>, id: &str) -> Result<()> {
        let spec = {
            let mut config = self.config.lock();
            let Some(spec) = config.ports.iter_mut().find(|p| p.identifier() == id) else {
                return Err(IngestError::UnknownPort { id: id.to_string() });
            };
            if spec.enabled {
                return Ok(());
            }
            spec.enabled = true;
            spec.clone()
        };
        self.bring_up(&spec).await
    }

    pub async fn disable_port(&self, id: &str) -> Result<()> {
        let found = {
            let mut config = self.config.lock();
            match config.ports.iter_mut().find(|p| p.identifier() == id) {
                Some(spec) => {
                    spec.enabled = false;
                    Some(spec.kind)
                }
                None => None,
            }
        };
        let Some(kind) = found else {
            return Err(IngestError::UnknownPort { id: id.to_string() });
        };

        match kind {
            PortKind::Serial => {
                if let Some(mut channel) = self.serial_channels.lock().remove(id) {
                    channel.stop();
                }
            }
            PortKind::Http => {
                let config = self.config.lock().clone();
                let listen_port = self
                    .http_routes
                    .lock()
                    .iter()
                    .find(|e| e.url_path == id)
                    .map(|e| e.listen_port);
                if let Some(listen_port) = listen_port {
                    self.rebuild_http_listener(&config, listen_port).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn delete_port(&self, id: &str) -> Result<()> {
        let exists = self.config.lock().ports.iter().any(|p| p.identifier() == id);
        if !exists {
            return Err(IngestError::UnknownPort { id: id.to_string() });
        }
        let _ = self.disable_port(id).await;
        self.config.lock().ports.retain(|p| p.identifier() != id);
        Ok(())
    }

    /// Update an existing port's settings in place. For a Serial port whose
    /// `identifier()` (device path) is unchanged, the running channel is
    /// handed the new spec via `request_update` — it keeps serving its
    /// current session and transitions through `Reconnecting` at the next
    /// session boundary rather than dropping the line immediately. Any other
    /// change (HTTP, or a Serial device-path rename) is a delete-then-add.
    pub async fn update_port(self: &Arc<Self>, id: &str, new_spec: PortSpec) -> Result<()> {
        if !self.config.lock().ports.iter().any(|p| p.identifier() == id) {
            return Err(IngestError::UnknownPort { id: id.to_string() });
        }

        if new_spec.kind == PortKind::Serial && new_spec.identifier() == id {
            {
                let mut config = self.config.lock();
                if let Some(slot) = config.ports.iter_mut().find(|p| p.identifier() == id) {
                    *slot = new_spec.clone();
                }
            }
            if new_spec.enabled {
                if let Some(channel) = self.serial_channels.lock().get(id) {
                    channel.request_update(new_spec);
                } else {
                    self.bring_up(&new_spec).await?;
                }
            } else {
                self.disable_port(id).await?;
            }
            return Ok(());
        }

        self.delete_port(id).await?;
        self.add_port(new_spec).await
    }

    pub fn snapshot_one(&self, id: &str) -> Option<ChannelStats> {
        if let Some(stats) = self.serial_channels.lock().get(id).map(|c| c.snapshot()) {
            return Some(stats);
        }
        self.http_routes.lock().iter().find(|e| e.url_path == id).map(|e| e.stats.lock().clone())
    }
}

struct NullPublisher;
impl Publisher for NullPublisher {
    fn publish(&self, _subject: &str, _payload: Vec<u8>) -> std::result::Result<(), String> {
        Ok(())
    }
}

impl SnapshotSource for Supervisor {
    fn snapshot_all(&self) -> Vec<ChannelSnapshot> {
        let mut out = Vec::new();
        for (id, channel) in self.serial_channels.lock().iter() {
            out.push(ChannelSnapshot::new(id, &channel.designation, channel.snapshot()));
        }
        for entry in self.http_routes.lock().iter() {
            let stats = entry.stats.lock().clone();
            let id = format!("{}:{}", entry.listen_port, entry.url_path);
            out.push(ChannelSnapshot::new(&id, &entry.designation, stats));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_publisher_always_succeeds() {
        let p = NullPublisher;
        assert!(p.publish("x", vec![]).is_ok());
    }
}
