//! Cross-module integration tests for the CDR ingest pipeline.
//!
//! These exercise the Dual Sink / HTTP Channel / model seams together
//! rather than any one module in isolation; per-module edge cases (line
//! buffering, backoff arithmetic, autobaud ratio math, config validation)
//! are covered by the `#[cfg(test)]` suites colocated with each module.

use axum::extract::{ConnectInfo, State};
use axum::http::Request;
use axum::Json;
use cdr_ingestd::broker::events::EventPublisher;
use cdr_ingestd::broker::Publisher;
use cdr_ingestd::http;
use cdr_ingestd::http::RouteState;
use cdr_ingestd::line_reader::{LineOutcome, LineReader};
use cdr_ingestd::model::{build_record, fips_is_valid, format_header, ChannelState, ChannelStats};
use cdr_ingestd::sink::{DualSink, SinkOutcome};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::tempdir;

/// Records every publish call it receives, optionally failing them.
struct FakeBroker {
    fail: bool,
    received: Mutex<Vec<(String, Vec<u8>)>>,
}

impl FakeBroker {
    fn ok() -> Arc<Self> {
        Arc::new(Self {
            fail: false,
            received: Mutex::new(Vec::new()),
        })
    }
}

impl Publisher for FakeBroker {
    fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), String> {
        self.received.lock().push((subject.to_string(), payload));
        if self.fail {
            Err("broker unreachable".to_string())
        } else {
            Ok(())
        }
    }
}

/// Scenario 1 (spec.md §8): a line arriving at the serial source ends up in
/// the file with the literal header and is published to the broker with
/// the same bytes (I1, R1).
#[test]
fn happy_serial_line_reaches_file_and_broker_with_matching_bytes() {
    let dir = tempdir().unwrap();
    let broker = FakeBroker::ok();
    let sink = DualSink::new(
        dir.path().join("1429010002-A1.log"),
        "serial.1429010002".to_string(),
        broker.clone(),
        100,
        5,
        false,
    )
    .unwrap();

    // Simulate bytes trickling in off the wire, split across two reads.
    let mut reader = LineReader::new();
    let mut lines = Vec::new();
    for outcome in reader.feed(b"HEL") {
        if let LineOutcome::Line(l) = outcome {
            lines.push(l);
        }
    }
    for outcome in reader.feed(b"LO\n") {
        if let LineOutcome::Line(l) = outcome {
            lines.push(l);
        }
    }
    assert_eq!(lines, vec![b"HELLO".to_vec()]);

    let ts = Utc::now();
    let record = build_record("1429010002", "A1", ts, &lines[0]);
    let outcome = sink.write_line(&record).unwrap();
    assert_eq!(outcome, SinkOutcome::Ok);

    let file_contents = std::fs::read_to_string(dir.path().join("1429010002-A1.log")).unwrap();
    assert!(file_contents.starts_with("[1429010002][A1]["));
    assert!(file_contents.ends_with("HELLO\n"));

    let published = broker.received.lock();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "serial.1429010002");
    assert_eq!(published[0].1, file_contents.into_bytes());
}

/// I1/I2: two records from the same channel land in the file and the
/// broker stream in the same relative order.
#[test]
fn two_records_preserve_relative_order_across_both_sinks() {
    let dir = tempdir().unwrap();
    let broker = FakeBroker::ok();
    let sink = DualSink::new(
        dir.path().join("1429010002-A1.log"),
        "serial.1429010002".to_string(),
        broker.clone(),
        100,
        5,
        false,
    )
    .unwrap();

    let ts = Utc::now();
    sink.write_line(&build_record("1429010002", "A1", ts, b"first")).unwrap();
    sink.write_line(&build_record("1429010002", "A1", ts, b"second")).unwrap();

    let contents = std::fs::read_to_string(dir.path().join("1429010002-A1.log")).unwrap();
    let file_lines: Vec<&str> = contents.lines().collect();
    assert!(file_lines[0].ends_with("first"));
    assert!(file_lines[1].ends_with("second"));

    let published = broker.received.lock();
    assert!(published[0].1.ends_with(b"first\n"));
    assert!(published[1].1.ends_with(b"second\n"));
}

/// Spec's Open Question, preserved as specified: a broker-only publish
/// failure does not fail the call (file already succeeded) and is tracked
/// separately from the channel's generic error counter.
#[test]
fn broker_failure_does_not_fail_the_write_when_file_succeeds() {
    let dir = tempdir().unwrap();
    let broker = Arc::new(FakeBroker {
        fail: true,
        received: Mutex::new(Vec::new()),
    });
    let sink = DualSink::new(
        dir.path().join("1429010002-A1.log"),
        "serial.1429010002".to_string(),
        broker,
        100,
        5,
        false,
    )
    .unwrap();

    let ts = Utc::now();
    let outcome = sink.write_line(&build_record("1429010002", "A1", ts, b"ALARM")).unwrap();
    assert_eq!(outcome, SinkOutcome::BrokerPublishFailed);

    let contents = std::fs::read_to_string(dir.path().join("1429010002-A1.log")).unwrap();
    assert!(contents.ends_with("ALARM\n"));
}

/// Scenario 5 (spec.md §8): POST with a body and a header is reconstructed
/// as request-line + headers + blank line + body, then framed and handed
/// to the Dual Sink (R2). Drives the real `handle_capture` handler so a
/// regression that drops the request-line/headers/peer-address
/// reconstruction and stores only the raw body is caught.
#[tokio::test]
async fn http_capture_stores_request_line_headers_and_body() {
    let dir = tempdir().unwrap();
    let broker = FakeBroker::ok();
    let sink = Arc::new(
        DualSink::new(
            dir.path().join("1429010002-B1.log"),
            "http.1429010002".to_string(),
            broker,
            100,
            5,
            false,
        )
        .unwrap(),
    );
    let stats = Arc::new(Mutex::new(ChannelStats::new(ChannelState::Running)));
    let state = RouteState {
        designation: "B1".to_string(),
        fips: "1429010002".to_string(),
        sink: sink.clone(),
        stats: stats.clone(),
        events: EventPublisher::new(None, "http", "site-1"),
    };
    let peer: SocketAddr = "10.0.0.5:54321".parse().unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/cdr")
        .header("Content-Type", "application/xml")
        .body(axum::body::Body::from("<x/>"))
        .unwrap();
    let (status, Json(body)) = http::handle_capture(State(state), ConnectInfo(peer), request).await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(body, serde_json::json!({ "status": "ok" }));
    assert_eq!(stats.lock().lines_in, 1);

    let contents = std::fs::read_to_string(dir.path().join("1429010002-B1.log")).unwrap();
    assert!(contents.starts_with("[1429010002][B1]["));
    let (_, payload) = contents.split_once("] ").unwrap();
    assert!(payload.starts_with("POST /cdr HTTP/1.1\n"));
    assert!(payload.contains("content-type: application/xml\n"));
    assert!(payload.contains(&format!("X-Remote-Addr: {peer}\n")));
    let (preamble, trailing) = payload.split_once("\n\n").unwrap();
    assert!(preamble.starts_with("POST /cdr HTTP/1.1"));
    assert_eq!(trailing, "<x/>\n");
}

/// Drives the real axum handler's method/body-size/empty-body rules
/// end-to-end, independent of http::mod's own colocated unit tests,
/// confirming the handler is reachable and wired to the Dual Sink through
/// the module boundary this test imports across.
#[tokio::test]
async fn http_handler_rejects_empty_body_and_accepts_a_real_one() {
    let dir = tempdir().unwrap();
    let broker = FakeBroker::ok();
    let sink = Arc::new(
        DualSink::new(
            dir.path().join("1429010002-B2.log"),
            "http.1429010002".to_string(),
            broker,
            100,
            5,
            false,
        )
        .unwrap(),
    );
    let stats = Arc::new(Mutex::new(ChannelStats::new(ChannelState::Running)));
    let state = RouteState {
        designation: "B2".to_string(),
        fips: "1429010002".to_string(),
        sink: sink.clone(),
        stats: stats.clone(),
        events: EventPublisher::new(None, "http", "site-1"),
    };
    let peer: SocketAddr = "10.0.0.5:54321".parse().unwrap();

    let empty_request = Request::builder()
        .method("POST")
        .uri("/cdr")
        .body(axum::body::Body::empty())
        .unwrap();
    let (status, _) = http::handle_capture(State(state.clone()), ConnectInfo(peer), empty_request).await;
    assert_eq!(status, axum::http::StatusCode::BAD_REQUEST);
    assert_eq!(stats.lock().lines_in, 0);

    let real_request = Request::builder()
        .method("POST")
        .uri("/cdr")
        .body(axum::body::Body::from("HELLO"))
        .unwrap();
    let (status, _) = http::handle_capture(State(state), ConnectInfo(peer), real_request).await;
    assert_eq!(status, axum::http::StatusCode::OK);
    assert_eq!(stats.lock().lines_in, 1);
}

/// B3/B4 boundary behavior on the validators the config layer and record
/// framing both depend on.
#[test]
fn designation_and_fips_boundaries() {
    assert!(cdr_ingestd::model::designation_is_valid("A16"));
    assert!(cdr_ingestd::model::designation_is_valid("B16"));
    assert!(!cdr_ingestd::model::designation_is_valid("A17"));
    assert!(fips_is_valid("0000000000"));
    assert!(!fips_is_valid("123456789"));
}

/// The header's millisecond field is always three digits and never
/// microseconds, across a timestamp with a fractional value that would
/// expose a formatting mistake.
#[test]
fn header_millisecond_field_is_exactly_three_digits() {
    let ts = DateTime::parse_from_rfc3339("2026-03-04T05:06:07.089Z")
        .unwrap()
        .with_timezone(&Utc);
    let header = format_header("1429010002", "A1", ts);
    assert_eq!(header, "[1429010002][A1][2026-03-04 05:06:07.089] ");
}
