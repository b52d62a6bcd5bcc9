//! HTTP Channel (C6)
//!
//! Per spec.md a configured HTTP port accepts POSTs at its path and treats
//! the body as one record (no line framing, no autobaud — the two things
//! that make this channel simpler than the Serial Channel). Several
//! configured ports can share a `listen_port`; the Supervisor groups their
//! `PortSpec`s and brings up one axum server per distinct `listen_port`
//! with one route per path, so `HttpChannel` itself only has to know about
//! a single already-bound listener and its route table.

use crate::broker::events::{EventPublisher, EventType};
use crate::constants::HTTP_MAX_BODY_BYTES;
use crate::error::{IngestError, Result};
use crate::model::{build_record, ChannelState, ChannelStats};
use crate::sink::{DualSink, SinkOutcome};
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// One configured HTTP route, fully resolved against its sink and stats —
/// everything `route_handler` needs, with no further config lookups.
#[derive(Clone)]
pub struct HttpRoute {
    pub url_path: String,
    pub designation: String,
    pub fips: String,
    pub sink: Arc<DualSink>,
    pub stats: Arc<Mutex<ChannelStats>>,
}

#[derive(Clone)]
pub struct RouteState {
    pub designation: String,
    pub fips: String,
    pub sink: Arc<DualSink>,
    pub stats: Arc<Mutex<ChannelStats>>,
    pub events: EventPublisher,
}

pub struct HttpChannel {
    pub listen_port: u16,
    cancel: CancellationToken,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl HttpChannel {
    /// Bind `listen_port` and serve every route in `routes`. Each route's
    /// `ChannelStats` starts life in `Running` — there is no detection
    /// phase, and the channel is considered up the moment the listener
    /// accepts its first connection.
    pub async fn spawn(
        listen_port: u16,
        routes: Vec<HttpRoute>,
        events: EventPublisher,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port))
            .await
            .map_err(|e| IngestError::HttpBind {
                port: listen_port,
                source: e,
            })?;

        let mut router = Router::new();
        for route in &routes {
            route.stats.lock().state = ChannelState::Running;
            let state = RouteState {
                designation: route.designation.clone(),
                fips: route.fips.clone(),
                sink: route.sink.clone(),
                stats: route.stats.clone(),
                events: events.clone(),
            };
            router = router.route(
                &route.url_path,
                post(handle_capture).with_state(state).layer(DefaultBodyLimit::max(HTTP_MAX_BODY_BYTES)),
            );
        }

        let cancel = CancellationToken::new();
        let serve_cancel = cancel.clone();
        let join = tokio::spawn(async move {
            let result = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                serve_cancel.cancelled().await;
            })
            .await;
            if let Err(e) = result {
                error!(port = listen_port, error = %e, "http listener exited with error");
            }
        });

        Ok(Self {
            listen_port,
            cancel,
            join: Some(join),
        })
    }

    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

pub async fn handle_capture(
    State(state): State<RouteState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> (StatusCode, Json<Value>) {
    let (parts, body) = request.into_parts();

    // `DefaultBodyLimit` on the route already rejects an oversized body
    // before the handler runs, but `to_bytes` enforces the same limit
    // itself (belt and suspenders) and spec.md calls for 400 either way,
    // not axum's default 413.
    let body = match axum::body::to_bytes(body, HTTP_MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "body exceeds maximum size"),
    };
    if body.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "empty body");
    }

    // Reconstruct the request as text: request-line, one header per line,
    // the synthesized peer-address header, a blank separator line, then the
    // body verbatim — this is the textual record spec.md §4.6 defines, not
    // just the raw POST body.
    let mut preamble = format!("{} {} {:?}\n", parts.method, parts.uri, parts.version);
    for (name, value) in parts.headers.iter() {
        preamble.push_str(name.as_str());
        preamble.push_str(": ");
        preamble.push_str(value.to_str().unwrap_or(""));
        preamble.push('\n');
    }
    preamble.push_str(&format!("X-Remote-Addr: {peer}\n"));
    preamble.push('\n');

    let mut payload = preamble.into_bytes();
    payload.extend_from_slice(&body);

    let ts = Utc::now();
    let record = build_record(&state.fips, &state.designation, ts, &payload);

    state.stats.lock().bytes_in += body.len() as u64;

    // `DualSink::write_line` blocks on file I/O and (via `BrokerHandle::publish`)
    // on the broker client's own blocking call, so it must not run directly on
    // an axum/tokio worker thread — push it onto the blocking pool, same as
    // the Serial Channel's dedicated OS thread does implicitly.
    let sink = state.sink.clone();
    let write_result = tokio::task::spawn_blocking(move || sink.write_line(&record))
        .await
        .expect("sink write task panicked");

    match write_result {
        Ok(SinkOutcome::Ok) => {
            let mut s = state.stats.lock();
            s.lines_in += 1;
            s.last_line_time = Some(ts);
            ok_response()
        }
        Ok(SinkOutcome::BrokerPublishFailed) => {
            let mut s = state.stats.lock();
            s.lines_in += 1;
            s.last_line_time = Some(ts);
            s.broker_publish_failures += 1;
            ok_response()
        }
        Err(e) => {
            state.stats.lock().errors += 1;
            warn!(designation = %state.designation, error = %e, "http capture sink write failed");
            state.events.publish(
                EventType::Error,
                Some(&state.designation),
                None,
                Some("sink write failed"),
                None,
            );
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "sink write failed")
        }
    }
}

fn ok_response() -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

fn error_response(status: StatusCode, reason: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "status": "error", "reason": reason })))
}

/// Group enabled HTTP port specs by `listen_port`, preserving each port's
/// route. Used by the Supervisor to decide how many axum servers to bring
/// up (one per distinct `listen_port`, not one per configured port).
pub fn group_by_listen_port(routes: Vec<HttpRoute>, ports: &[u16]) -> HashMap<u16, Vec<HttpRoute>> {
    let mut grouped: HashMap<u16, Vec<HttpRoute>> = HashMap::new();
    for (route, &port) in routes.into_iter().zip(ports.iter()) {
        grouped.entry(port).or_default().push(route);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Publisher;
    use tempfile::tempdir;

    struct NullPublisher;
    impl Publisher for NullPublisher {
        fn publish(&self, _subject: &str, _payload: Vec<u8>) -> std::result::Result<(), String> {
            Ok(())
        }
    }

    fn make_sink(dir: &std::path::Path) -> Arc<DualSink> {
        Arc::new(
            DualSink::new(
                dir.join("1429010002-B1.log"),
                "http.1429010002".to_string(),
                Arc::new(NullPublisher),
                100,
                5,
                false,
            )
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn handle_capture_writes_record_and_returns_200_ok_status() {
        let dir = tempdir().unwrap();
        let stats = Arc::new(Mutex::new(ChannelStats::new(ChannelState::Running)));
        let state = RouteState {
            designation: "B1".to_string(),
            fips: "1429010002".to_string(),
            sink: make_sink(dir.path()),
            stats: stats.clone(),
            events: EventPublisher::new(None, "http", "site-1"),
        };

        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let request = Request::builder().body(axum::body::Body::from("ALARM DATA")).unwrap();
        let (status, Json(body)) = handle_capture(State(state), ConnectInfo(peer), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok" }));
        assert_eq!(stats.lock().lines_in, 1);

        let contents = std::fs::read_to_string(dir.path().join("1429010002-B1.log")).unwrap();
        assert!(contents.ends_with("ALARM DATA\n"));
        assert!(contents.starts_with("[1429010002][B1]["));
    }

    #[tokio::test]
    async fn empty_body_is_rejected_with_400() {
        let dir = tempdir().unwrap();
        let stats = Arc::new(Mutex::new(ChannelStats::new(ChannelState::Running)));
        let state = RouteState {
            designation: "B1".to_string(),
            fips: "1429010002".to_string(),
            sink: make_sink(dir.path()),
            stats: stats.clone(),
            events: EventPublisher::new(None, "http", "site-1"),
        };

        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let request = Request::builder().body(axum::body::Body::empty()).unwrap();
        let (status, _) = handle_capture(State(state), ConnectInfo(peer), request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(stats.lock().lines_in, 0);
    }

    #[test]
    fn grouping_collects_routes_sharing_a_listen_port() {
        let dir = tempdir().unwrap();
        let routes = vec![
            HttpRoute {
                url_path: "/a".to_string(),
                designation: "B1".to_string(),
                fips: "1429010002".to_string(),
                sink: make_sink(dir.path()),
                stats: Arc::new(Mutex::new(ChannelStats::new(ChannelState::Running))),
            },
            HttpRoute {
                url_path: "/b".to_string(),
                designation: "B2".to_string(),
                fips: "1429010002".to_string(),
                sink: make_sink(dir.path()),
                stats: Arc::new(Mutex::new(ChannelStats::new(ChannelState::Running))),
            },
        ];
        let grouped = group_by_listen_port(routes, &[8080, 8080]);
        assert_eq!(grouped.len(), 1);
        assert_eq!(grouped[&8080].len(), 2);
    }
}
