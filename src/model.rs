//! Core data model shared across the ingest daemon
//!
//! `PortSpec` describes one configured source; `Record` is the framed unit
//! that channels hand to the Dual Sink; `ChannelState`/`ChannelStats` are the
//! observable state of a running channel; `SinkDescriptor` derives the two
//! concrete destinations (file path, broker subject) from a spec.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// =============================================================================
// Validation patterns (grounded in spec.md §6)
// =============================================================================

static DESIGNATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[AB]([1-9]|1[0-6])$").expect("valid regex"));

static FIPS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{10}$").expect("valid regex"));

pub fn designation_is_valid(s: &str) -> bool {
    DESIGNATION_RE.is_match(s)
}

pub fn fips_is_valid(s: &str) -> bool {
    FIPS_RE.is_match(s)
}

// =============================================================================
// PortSpec
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    Serial,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

impl Default for Parity {
    fn default() -> Self {
        Parity::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StopBits {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "1.5")]
    OnePointFive,
    #[serde(rename = "2")]
    Two,
}

impl Default for StopBits {
    fn default() -> Self {
        StopBits::One
    }
}

/// Tri-state flow control: `None` leaves the choice to detection/adapter defaults.
pub type FlowControl = Option<bool>;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSpec {
    #[serde(rename = "type")]
    pub kind: PortKind,

    // --- serial-only ---
    #[serde(rename = "device")]
    pub device_path: String,
    #[serde(rename = "baud_rate")]
    pub baud: Option<u32>,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    #[serde(rename = "use_flow_control")]
    pub flow_control: FlowControl,

    // --- http-only ---
    #[serde(rename = "path")]
    pub url_path: String,
    pub listen_port: u16,

    // --- common ---
    pub designation: String,
    #[serde(rename = "fips_code")]
    pub fips: Option<String>,
    pub vendor: Option<String>,
    pub county: Option<String>,
    pub enabled: bool,
    pub description: Option<String>,
}

impl Default for PortSpec {
    fn default() -> Self {
        Self {
            kind: PortKind::Serial,
            device_path: String::new(),
            baud: None,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: None,
            url_path: String::new(),
            listen_port: 0,
            designation: String::new(),
            fips: None,
            vendor: None,
            county: None,
            enabled: true,
            description: None,
        }
    }
}

impl PortSpec {
    /// Identifier used by the supervisor's dynamic add/enable/disable/delete
    /// surface: the device path (serial) or the `url_path` (HTTP).
    pub fn identifier(&self) -> &str {
        match self.kind {
            PortKind::Serial => &self.device_path,
            PortKind::Http => &self.url_path,
        }
    }
}

// =============================================================================
// ChannelState
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Detecting,
    Running,
    WaitingForBroker,
    Reconnecting,
    Stopped,
    Error,
}

// =============================================================================
// ChannelStats
// =============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ModemLines {
    pub cts: bool,
    pub dsr: bool,
    pub dcd: bool,
    pub ri: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStats {
    pub bytes_in: u64,
    pub lines_in: u64,
    pub errors: u64,
    pub reconnects: u64,
    pub broker_publish_failures: u64,
    pub start_time: DateTime<Utc>,
    pub last_line_time: Option<DateTime<Utc>>,
    pub baud: Option<u32>,
    pub flow_control: Option<bool>,
    pub modem_lines: Option<ModemLines>,
    pub consecutive_failures: u32,
    pub state: ChannelState,
}

impl ChannelStats {
    pub fn new(initial_state: ChannelState) -> Self {
        Self {
            bytes_in: 0,
            lines_in: 0,
            errors: 0,
            reconnects: 0,
            broker_publish_failures: 0,
            start_time: Utc::now(),
            last_line_time: None,
            baud: None,
            flow_control: None,
            modem_lines: None,
            consecutive_failures: 0,
            state: initial_state,
        }
    }

    pub fn last_line_ago_seconds(&self) -> i64 {
        match self.last_line_time {
            Some(t) => (Utc::now() - t).num_seconds().max(0),
            None => -1,
        }
    }
}

/// Read-only copy of one channel's identity + stats, handed to the Health
/// Publisher and (eventually) an external monitoring surface. Never built
/// from a live reference — always a snapshot taken under the stats lock.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub id: String,
    pub designation: String,
    pub stats: ChannelStats,
    pub last_line_ago_seconds: i64,
}

impl ChannelSnapshot {
    pub fn new(id: &str, designation: &str, stats: ChannelStats) -> Self {
        let last_line_ago_seconds = stats.last_line_ago_seconds();
        Self {
            id: id.to_string(),
            designation: designation.to_string(),
            stats,
            last_line_ago_seconds,
        }
    }
}

// =============================================================================
// Record / header framing (spec.md §3, §6 — byte-for-byte format)
// =============================================================================

/// Build the literal header `[FIPS][DESIGNATION][YYYY-MM-DD hh:mm:ss.mmm] `.
///
/// Millisecond field is always three digits, zero-padded; never microseconds.
pub fn format_header(fips: &str, designation: &str, ts: DateTime<Utc>) -> String {
    format!(
        "[{fips}][{designation}][{}] ",
        ts.format("%Y-%m-%d %H:%M:%S%.3f")
    )
}

/// Build a complete record: header + payload, with exactly one trailing newline.
pub fn build_record(fips: &str, designation: &str, ts: DateTime<Utc>, payload: &[u8]) -> Vec<u8> {
    let header = format_header(fips, designation, ts);
    let mut out = Vec::with_capacity(header.len() + payload.len() + 1);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    if !out.ends_with(b"\n") {
        out.push(b'\n');
    }
    out
}

// =============================================================================
// SinkDescriptor
// =============================================================================

#[derive(Debug, Clone)]
pub struct SinkDescriptor {
    pub file_path: PathBuf,
    pub subject: String,
}

/// Derive the stable (file_path, subject) pair for a port spec.
///
/// `subject` gracefully collapses when optional fields are absent:
/// `{prefix}.{vendor}.{county}.{fips}` -> `{prefix}.{vendor}.{fips}` ->
/// `{prefix}.{fips}`.
pub fn derive_sink_descriptor(log_base: &std::path::Path, prefix: &str, spec: &PortSpec) -> SinkDescriptor {
    let fips = spec.fips.clone().unwrap_or_default();
    let designation = &spec.designation;

    let file_path = log_base.join(format!("{fips}-{designation}.log"));

    let mut parts = vec![prefix.to_string()];
    if let Some(vendor) = spec.vendor.as_ref().filter(|v| !v.is_empty()) {
        parts.push(vendor.clone());
    }
    if let Some(county) = spec.county.as_ref().filter(|c| !c.is_empty()) {
        parts.push(county.clone());
    }
    parts.push(fips);
    let subject = parts.join(".");

    SinkDescriptor { file_path, subject }
}

/// Extract the `{state}` token: the subject prefix up to its first dot.
pub fn state_token(prefix: &str) -> &str {
    prefix.split('.').next().unwrap_or(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn designation_bounds() {
        assert!(designation_is_valid("A1"));
        assert!(designation_is_valid("A16"));
        assert!(designation_is_valid("B16"));
        assert!(!designation_is_valid("A17"));
        assert!(!designation_is_valid("C1"));
        assert!(!designation_is_valid("A0"));
    }

    #[test]
    fn fips_bounds() {
        assert!(fips_is_valid("0000000000"));
        assert!(!fips_is_valid("123456789"));
        assert!(!fips_is_valid("12345678901"));
    }

    #[test]
    fn header_literal_format() {
        let ts = DateTime::parse_from_rfc3339("2026-01-02T03:04:05.678Z")
            .unwrap()
            .with_timezone(&Utc);
        let header = format_header("1429010002", "A1", ts);
        assert_eq!(header, "[1429010002][A1][2026-01-02 03:04:05.678] ");
    }

    #[test]
    fn record_gets_exactly_one_trailing_newline() {
        let ts = Utc::now();
        let rec = build_record("1429010002", "A1", ts, b"HELLO");
        assert!(rec.ends_with(b"HELLO\n"));
        assert!(!rec.ends_with(b"\n\n"));

        let rec2 = build_record("1429010002", "A1", ts, b"HELLO\n");
        assert_eq!(rec2.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn sink_descriptor_collapses_optional_fields() {
        let base = std::path::Path::new("/var/log/cdr");
        let mut spec = PortSpec {
            fips: Some("1429010002".to_string()),
            designation: "A1".to_string(),
            ..Default::default()
        };
        let d = derive_sink_descriptor(base, "serial", &spec);
        assert_eq!(d.subject, "serial.1429010002");
        assert_eq!(d.file_path, base.join("1429010002-A1.log"));

        spec.vendor = Some("acme".to_string());
        let d = derive_sink_descriptor(base, "serial", &spec);
        assert_eq!(d.subject, "serial.acme.1429010002");

        spec.county = Some("dupage".to_string());
        let d = derive_sink_descriptor(base, "serial", &spec);
        assert_eq!(d.subject, "serial.acme.dupage.1429010002");
    }

    #[test]
    fn state_token_is_prefix_up_to_first_dot() {
        assert_eq!(state_token("serial.acme.dupage"), "serial");
        assert_eq!(state_token("serial"), "serial");
    }
}
