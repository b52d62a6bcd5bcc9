//! Event Publisher (C9)
//!
//! Publishes discrete lifecycle events to `{state}.events.{instance}`.
//! Best-effort: nil-safe when no broker is configured, silent-drop when
//! disconnected (the underlying publish already swallows that).

use super::Publisher;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ServiceStart,
    ServiceStop,
    UncleanShutdown,
    StateChange,
    SignalLost,
    SignalDetected,
    Reconnect,
    BaudDetected,
    Error,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceStart => "service_start",
            Self::ServiceStop => "service_stop",
            Self::UncleanShutdown => "unclean_shutdown",
            Self::StateChange => "state_change",
            Self::SignalLost => "signal_lost",
            Self::SignalDetected => "signal_detected",
            Self::Reconnect => "reconnect",
            Self::BaudDetected => "baud_detected",
            Self::Error => "error",
        }
    }
}

#[derive(Clone)]
pub struct EventPublisher {
    broker: Option<Arc<dyn Publisher>>,
    subject: String,
    instance: String,
}

impl EventPublisher {
    pub fn new(broker: Option<Arc<dyn Publisher>>, state_token: &str, instance: &str) -> Self {
        Self {
            broker,
            subject: format!("{state_token}.events.{instance}"),
            instance: instance.to_string(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn publish(
        &self,
        event_type: EventType,
        ch: Option<&str>,
        dev: Option<&str>,
        msg: Option<&str>,
        details: Option<Value>,
    ) {
        let Some(broker) = &self.broker else { return };
        let payload = json!({
            "ts": Utc::now(),
            "type": event_type.as_str(),
            "instance": self.instance,
            "ch": ch,
            "dev": dev,
            "msg": msg,
            "details": details,
        });
        let Ok(bytes) = serde_json::to_vec(&payload) else {
            return;
        };
        if let Err(reason) = broker.publish(&self.subject, bytes) {
            warn!(subject = %self.subject, %reason, "event publish failed");
        }
    }

    /// At supervisor start: fetch the last message on the events stream
    /// (`deliver_last` semantics) and, if it exists and isn't
    /// `service_stop`, emit `unclean_shutdown` carrying the prior event's
    /// type and timestamp, then always emit `service_start`.
    pub async fn check_unclean_shutdown_and_announce_start(&self, js: Option<async_nats::jetstream::Context>) {
        if let Some(js) = js {
            if let Ok(stream) = js.get_stream("events").await {
                if let Ok(msg) = stream.get_last_raw_message_by_subject(&self.subject).await {
                    if let Ok(payload) = serde_json::from_slice::<Value>(&msg.payload) {
                        let prior_type = payload
                            .get("type")
                            .and_then(|v| v.as_str())
                            .unwrap_or("")
                            .to_string();
                        let prior_ts = payload.get("ts").cloned();
                        if prior_type != EventType::ServiceStop.as_str() {
                            self.publish(
                                EventType::UncleanShutdown,
                                None,
                                None,
                                Some(&prior_type),
                                prior_ts.map(|ts| json!({ "prior_ts": ts })),
                            );
                        }
                    }
                }
            }
        }
        self.publish(EventType::ServiceStart, None, None, None, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingPublisher {
        calls: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, subject: &str, payload: Vec<u8>) -> std::result::Result<(), String> {
            self.calls.lock().push((subject.to_string(), payload));
            Ok(())
        }
    }

    #[test]
    fn subject_uses_state_token_and_instance() {
        let publisher = EventPublisher::new(None, "serial", "site-1");
        assert_eq!(publisher.subject(), "serial.events.site-1");
    }

    #[test]
    fn publish_is_nil_safe_without_broker() {
        let publisher = EventPublisher::new(None, "serial", "site-1");
        publisher.publish(EventType::ServiceStart, None, None, None, None);
    }

    #[test]
    fn publish_emits_json_with_required_fields() {
        let rec = Arc::new(RecordingPublisher {
            calls: Mutex::new(Vec::new()),
        });
        let publisher = EventPublisher::new(Some(rec.clone() as Arc<dyn Publisher>), "serial", "site-1");
        publisher.publish(EventType::Reconnect, Some("A1"), Some("/dev/ttyS0"), None, None);

        let calls = rec.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "serial.events.site-1");
        let value: Value = serde_json::from_slice(&calls[0].1).unwrap();
        assert_eq!(value["type"], "reconnect");
        assert_eq!(value["instance"], "site-1");
        assert_eq!(value["ch"], "A1");
        assert!(value["ts"].is_string());
    }
}
