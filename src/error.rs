//! Centralized error types for the ingest daemon
//!
//! All daemon errors are represented by the `IngestError` enum.
//! Use `Result<T>` as shorthand for `std::result::Result<T, IngestError>`.

use std::fmt;
use std::path::PathBuf;

/// All ingest daemon errors
#[derive(Debug)]
pub enum IngestError {
    // === Serial port open ===
    PortBusy { device: String },
    PortMissing { device: String },
    PermissionDenied { device: String },
    InvalidMode { device: String, reason: String },

    // === Serial port I/O ===
    PortIo {
        device: String,
        source: std::io::Error,
    },

    // === Detection ===
    DetectionFailed { device: String },

    // === Sink ===
    SinkFileWrite {
        path: PathBuf,
        source: std::io::Error,
    },
    SinkBrokerPublish { subject: String, reason: String },

    // === Broker ===
    BrokerConnect { url: String, reason: String },
    BrokerDisconnected,

    // === HTTP ===
    HttpBind { port: u16, source: std::io::Error },

    // === Config ===
    ConfigRead {
        path: PathBuf,
        source: std::io::Error,
    },
    ConfigParse { path: PathBuf, reason: String },
    ConfigValidation { field: String, reason: String },

    // === Supervisor ===
    DuplicatePort { field: &'static str, value: String },
    UnknownPort { id: String },
    NoChannelsStarted,
}

impl std::error::Error for IngestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::PortIo { source, .. }
            | Self::SinkFileWrite { source, .. }
            | Self::HttpBind { source, .. }
            | Self::ConfigRead { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PortBusy { device } => write!(f, "serial port busy: {device}"),
            Self::PortMissing { device } => write!(f, "serial port missing: {device}"),
            Self::PermissionDenied { device } => {
                write!(f, "permission denied opening {device}")
            }
            Self::InvalidMode { device, reason } => {
                write!(f, "invalid mode for {device}: {reason}")
            }
            Self::PortIo { device, source } => write!(f, "I/O error on {device}: {source}"),
            Self::DetectionFailed { device } => {
                write!(f, "autobaud detection failed on {device}")
            }
            Self::SinkFileWrite { path, source } => {
                write!(f, "failed writing {}: {source}", path.display())
            }
            Self::SinkBrokerPublish { subject, reason } => {
                write!(f, "failed publishing to {subject}: {reason}")
            }
            Self::BrokerConnect { url, reason } => {
                write!(f, "failed connecting to broker {url}: {reason}")
            }
            Self::BrokerDisconnected => write!(f, "broker is not reachable"),
            Self::HttpBind { port, source } => write!(f, "cannot bind HTTP port {port}: {source}"),
            Self::ConfigRead { path, source } => {
                write!(f, "cannot read config {}: {source}", path.display())
            }
            Self::ConfigParse { path, reason } => {
                write!(f, "cannot parse config {}: {reason}", path.display())
            }
            Self::ConfigValidation { field, reason } => write!(f, "invalid {field}: {reason}"),
            Self::DuplicatePort { field, value } => {
                write!(f, "duplicate {field}: {value}")
            }
            Self::UnknownPort { id } => write!(f, "no such port: {id}"),
            Self::NoChannelsStarted => write!(f, "no channels started successfully"),
        }
    }
}

/// Alias for Result with IngestError
pub type Result<T> = std::result::Result<T, IngestError>;
