//! Dual Sink (C3)
//!
//! Accepts a framed record and, in order, (a) appends it to the rotating
//! file (primary — its failure is the returned error) and (b) publishes
//! it to the broker subject (secondary — its failure is logged and
//! counted but does not fail the call). Calls are serialized through an
//! internal mutex so a channel's file bytes and broker messages appear in
//! the same relative order (I1, I2).

pub mod file;

use crate::broker::Publisher;
use crate::error::{IngestError, Result};
use file::RotatingFileWriter;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Outcome of a successful `write_line` call — distinguishes a clean write
/// from one where the file succeeded but the broker publish failed, since
/// the two must be counted differently by the calling channel (spec.md's
/// open question: broker-only failures are tracked but do not count
/// against the channel's generic error counter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkOutcome {
    Ok,
    BrokerPublishFailed,
}

pub struct DualSink {
    file_path: PathBuf,
    subject: String,
    broker: Arc<dyn Publisher>,
    file: Mutex<RotatingFileWriter>,
}

impl DualSink {
    pub fn new(
        file_path: PathBuf,
        subject: String,
        broker: Arc<dyn Publisher>,
        max_size_mb: u64,
        max_backups: usize,
        compress: bool,
    ) -> Result<Self> {
        let writer = RotatingFileWriter::open(file_path.clone(), max_size_mb, max_backups, compress)
            .map_err(|e| IngestError::SinkFileWrite {
                path: file_path.clone(),
                source: e,
            })?;
        Ok(Self {
            file_path,
            subject,
            broker,
            file: Mutex::new(writer),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Append a newline if missing, then write file then publish broker,
    /// in that order, under one lock.
    pub fn write_line(&self, record: &[u8]) -> Result<SinkOutcome> {
        let mut owned;
        let bytes: &[u8] = if record.ends_with(b"\n") {
            record
        } else {
            owned = Vec::with_capacity(record.len() + 1);
            owned.extend_from_slice(record);
            owned.push(b'\n');
            &owned
        };

        let mut guard = self.file.lock();
        let file_result = guard.write_record(bytes);
        let broker_result = self.broker.publish(&self.subject, bytes.to_vec());
        drop(guard);

        if let Err(e) = file_result {
            return Err(IngestError::SinkFileWrite {
                path: self.file_path.clone(),
                source: e,
            });
        }

        match broker_result {
            Ok(()) => Ok(SinkOutcome::Ok),
            Err(reason) => {
                warn!(subject = %self.subject, %reason, "broker publish failed; file write succeeded");
                Ok(SinkOutcome::BrokerPublishFailed)
            }
        }
    }

    pub fn close(&self) {
        let mut guard = self.file.lock();
        let _ = guard.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PMutex;
    use tempfile::tempdir;

    struct FakePublisher {
        fail: bool,
        received: PMutex<Vec<(String, Vec<u8>)>>,
    }

    impl FakePublisher {
        fn ok() -> Self {
            Self {
                fail: false,
                received: PMutex::new(Vec::new()),
            }
        }
        fn failing() -> Self {
            Self {
                fail: true,
                received: PMutex::new(Vec::new()),
            }
        }
    }

    impl Publisher for FakePublisher {
        fn publish(&self, subject: &str, payload: Vec<u8>) -> std::result::Result<(), String> {
            self.received.lock().push((subject.to_string(), payload.clone()));
            if self.fail {
                Err("broker unreachable".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn sink(dir: &std::path::Path, broker: Arc<dyn Publisher>) -> DualSink {
        DualSink::new(
            dir.join("1429010002-A1.log"),
            "serial.1429010002".to_string(),
            broker,
            100,
            5,
            false,
        )
        .unwrap()
    }

    #[test]
    fn happy_path_writes_file_and_publishes() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(FakePublisher::ok());
        let s = sink(dir.path(), broker.clone());

        let outcome = s.write_line(b"[1429010002][A1][2026-01-01 00:00:00.000] HELLO\n").unwrap();
        assert_eq!(outcome, SinkOutcome::Ok);

        let contents = std::fs::read_to_string(dir.path().join("1429010002-A1.log")).unwrap();
        assert_eq!(contents, "[1429010002][A1][2026-01-01 00:00:00.000] HELLO\n");
        assert_eq!(broker.received.lock().len(), 1);
    }

    #[test]
    fn missing_trailing_newline_is_appended_exactly_once() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(FakePublisher::ok());
        let s = sink(dir.path(), broker);
        s.write_line(b"no newline here").unwrap();
        let contents = std::fs::read(dir.path().join("1429010002-A1.log")).unwrap();
        assert_eq!(contents.iter().filter(|&&b| b == b'\n').count(), 1);
        assert!(contents.ends_with(b"\n"));
    }

    #[test]
    fn broker_failure_is_swallowed_when_file_write_succeeds() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(FakePublisher::failing());
        let s = sink(dir.path(), broker);
        let outcome = s.write_line(b"HELLO\n").unwrap();
        assert_eq!(outcome, SinkOutcome::BrokerPublishFailed);
        let contents = std::fs::read_to_string(dir.path().join("1429010002-A1.log")).unwrap();
        assert_eq!(contents, "HELLO\n");
    }

    #[test]
    fn two_records_are_written_in_the_same_order_to_file_and_broker() {
        let dir = tempdir().unwrap();
        let broker = Arc::new(FakePublisher::ok());
        let s = sink(dir.path(), broker.clone());
        s.write_line(b"first\n").unwrap();
        s.write_line(b"second\n").unwrap();

        let contents = std::fs::read_to_string(dir.path().join("1429010002-A1.log")).unwrap();
        assert_eq!(contents, "first\nsecond\n");

        let received = broker.received.lock();
        assert_eq!(received[0].1, b"first\n");
        assert_eq!(received[1].1, b"second\n");
    }

    #[test]
    fn file_write_failure_surfaces_as_the_returned_error() {
        // Point the sink at a path whose parent cannot be created (a file
        // masquerading as a directory) to force an open failure.
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let bad_path = blocker.join("1429010002-A1.log");

        let broker = Arc::new(FakePublisher::ok());
        let result = DualSink::new(bad_path, "serial.x".to_string(), broker, 100, 5, false);
        assert!(result.is_err());
    }
}
