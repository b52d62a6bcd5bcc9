//! Application-wide constants
//!
//! Centralized constants to avoid duplication and ensure consistency.

use std::time::Duration;

// =============================================================================
// Serial timeouts
// =============================================================================

/// Read timeout used while sampling for autobaud detection.
pub const DETECTION_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Read timeout used once a channel has settled into its production session.
pub const PRODUCTION_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// Settling delay between candidate baud rates during detection.
pub const AUTOBAUD_SETTLE_DELAY: Duration = Duration::from_millis(100);

// =============================================================================
// Line buffering
// =============================================================================

/// Initial capacity of a channel's line buffer.
pub const LINE_BUFFER_INITIAL: usize = 64 * 1024;

/// Hard cap on a single line. Lines longer than this are rejected.
pub const LINE_BUFFER_MAX: usize = 1024 * 1024;

// =============================================================================
// HTTP capture endpoint
// =============================================================================

/// Maximum accepted POST body size.
pub const HTTP_MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

// =============================================================================
// Reconnect / backoff
// =============================================================================

/// Ceiling applied to `consecutive_failures` before computing backoff, so the
/// exponent never overflows even after very long outages.
pub const MAX_BACKOFF_EXPONENT: u32 = 30;

// =============================================================================
// Broker availability gate
// =============================================================================

/// Maximum interval between gate polls while a channel waits on the broker.
pub const GATE_POLL_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Health / events
// =============================================================================

/// Interval between health heartbeats.
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Forwarder
// =============================================================================

/// Ack wait for the local JetStream pull consumer.
pub const FORWARDER_ACK_WAIT: Duration = Duration::from_secs(30);

/// How long a single `fetch` waits for a message before retrying.
pub const FORWARDER_FETCH_WAIT: Duration = Duration::from_secs(2);

/// Sleep between forwarder attempts while the remote broker is unreachable.
pub const FORWARDER_DOWN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// The local stream's consumer may have at most one message outstanding,
/// trading throughput for strict per-message ordering over the remote link.
pub const FORWARDER_MAX_ACK_PENDING: i64 = 1;

// =============================================================================
// Shutdown budget
// =============================================================================

/// Upper bound on graceful shutdown across all channels.
pub const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

/// Upper bound on HTTP listener shutdown specifically.
pub const HTTP_SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

// =============================================================================
// Validation
// =============================================================================

/// Canonical baud rates accepted by configuration validation.
pub const CANONICAL_BAUD_RATES: &[u32] = &[300, 1200, 2400, 4800, 9600, 19200, 38400, 57600, 115200];
