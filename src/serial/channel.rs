//! Serial Channel (C5) — the heart of the design
//!
//! Per-port state machine: Detecting -> Running -> WaitingForBroker /
//! Reconnecting -> ... Runs on a dedicated OS thread (mirroring the
//! grounding project's `transport/serial.rs` reader thread — low-latency
//! blocking I/O doesn't belong on the async executor) and is fully
//! independent of every other channel, coordinated only through the
//! shared Broker Availability Gate.

use crate::broker::events::{EventPublisher, EventType};
use crate::broker::gate::{AwaitOutcome, BrokerGate};
use crate::config::{DetectionConfig, RecoveryConfig};
use crate::constants::{
    DETECTION_READ_TIMEOUT, MAX_BACKOFF_EXPONENT, PRODUCTION_READ_TIMEOUT,
};
use crate::line_reader::{LineOutcome, LineReader};
use crate::model::{build_record, ChannelState, ChannelStats, PortSpec};
use crate::serial::adapter::{ReadOutcome, SerialAdapter};
use crate::serial::autobaud;
use crate::sink::{DualSink, SinkOutcome};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// What the outer session-retry loop does after one acquisition session
/// ends.
enum SessionOutcome {
    Stopped,
    /// Hard open/detection failure — not a mid-session I/O error, but
    /// handled identically (backoff, then retry) since the spec leaves
    /// the Error-state recovery path to "the supervisor may respawn" and
    /// a self-retrying channel achieves the same externally-observable
    /// behavior without the supervisor having to duplicate backoff state.
    HardError,
    Reconnect,
}

pub struct SerialChannel {
    pub designation: String,
    pub device_path: String,
    stats: Arc<Mutex<ChannelStats>>,
    cancel: CancellationToken,
    sink: Arc<DualSink>,
    spec: Arc<Mutex<PortSpec>>,
    reconnect_requested: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl SerialChannel {
    pub fn spawn(
        spec: PortSpec,
        detection: DetectionConfig,
        recovery: RecoveryConfig,
        sink: Arc<DualSink>,
        gate: Arc<BrokerGate>,
        events: EventPublisher,
    ) -> Self {
        let stats = Arc::new(Mutex::new(ChannelStats::new(ChannelState::Detecting)));
        let cancel = CancellationToken::new();

        let designation = spec.designation.clone();
        let device_path = spec.device_path.clone();

        let spec_cell = Arc::new(Mutex::new(spec.clone()));
        let reconnect_requested = Arc::new(AtomicBool::new(false));

        let thread_stats = stats.clone();
        let thread_cancel = cancel.clone();
        let thread_sink = sink.clone();
        let thread_spec = spec_cell.clone();
        let thread_reconnect_requested = reconnect_requested.clone();

        let join = std::thread::Builder::new()
            .name(format!("cdr-serial-{}", spec.designation))
            .spawn(move || {
                run(
                    thread_spec,
                    detection,
                    recovery,
                    thread_sink,
                    gate,
                    events,
                    thread_stats,
                    thread_cancel,
                    thread_reconnect_requested,
                )
            })
            .expect("failed to spawn serial channel thread");

        Self {
            designation,
            device_path,
            stats,
            cancel,
            sink,
            spec: spec_cell,
            reconnect_requested,
            join: Some(join),
        }
    }

    pub fn snapshot(&self) -> ChannelStats {
        self.stats.lock().clone()
    }

    /// Apply a new `PortSpec` (baud/parity/flow_control/description/etc.)
    /// and force the channel through its next session boundary so the new
    /// settings take effect (spec.md §4.7: "the affected channel transitions
    /// through Reconnecting on its next session boundary, the safe point").
    pub fn request_update(&self, new_spec: PortSpec) {
        *self.spec.lock() = new_spec;
        self.reconnect_requested.store(true, Ordering::SeqCst);
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        self.sink.close();
    }
}

fn set_state(stats: &Arc<Mutex<ChannelStats>>, state: ChannelState) {
    stats.lock().state = state;
}

fn run(
    spec: Arc<Mutex<PortSpec>>,
    detection: DetectionConfig,
    recovery: RecoveryConfig,
    sink: Arc<DualSink>,
    gate: Arc<BrokerGate>,
    events: EventPublisher,
    stats: Arc<Mutex<ChannelStats>>,
    cancel: CancellationToken,
    reconnect_requested: Arc<AtomicBool>,
) {
    loop {
        if cancel.is_cancelled() {
            set_state(&stats, ChannelState::Stopped);
            return;
        }

        let session_spec = spec.lock().clone();
        match run_one_session(
            &session_spec,
            &detection,
            &sink,
            &gate,
            &events,
            &stats,
            &cancel,
            &reconnect_requested,
        ) {
            SessionOutcome::Stopped => {
                set_state(&stats, ChannelState::Stopped);
                return;
            }
            SessionOutcome::HardError => {
                set_state(&stats, ChannelState::Error);
                events.publish(
                    EventType::Error,
                    Some(&spec.designation),
                    Some(&spec.device_path),
                    Some("session failed to start"),
                    None,
                );
                if !backoff_sleep(&stats, &recovery, &cancel) {
                    set_state(&stats, ChannelState::Stopped);
                    return;
                }
            }
            SessionOutcome::Reconnect => {
                set_state(&stats, ChannelState::Reconnecting);
                {
                    let mut s = stats.lock();
                    s.consecutive_failures += 1;
                    s.reconnects += 1;
                }
                events.publish(
                    EventType::Reconnect,
                    Some(&spec.designation),
                    Some(&spec.device_path),
                    None,
                    None,
                );
                if !backoff_sleep(&stats, &recovery, &cancel) {
                    set_state(&stats, ChannelState::Stopped);
                    return;
                }
            }
        }
    }
}

/// Sleep for the current backoff delay, interruptible by cancellation.
/// Returns `false` if cancellation fired during the sleep.
fn backoff_sleep(stats: &Arc<Mutex<ChannelStats>>, recovery: &RecoveryConfig, cancel: &CancellationToken) -> bool {
    let consecutive_failures = stats.lock().consecutive_failures.max(1);
    let delay = backoff_delay(
        Duration::from_secs(recovery.reconnect_delay_sec),
        Duration::from_secs(recovery.max_reconnect_delay_sec),
        recovery.exponential_backoff,
        consecutive_failures,
    );

    let deadline = std::time::Instant::now() + delay;
    while std::time::Instant::now() < deadline {
        if cancel.is_cancelled() {
            return false;
        }
        std::thread::sleep(Duration::from_millis(50).min(delay));
    }
    !cancel.is_cancelled()
}

/// Backoff delay after the k-th consecutive failure (I5): `base_delay` for
/// the first failure, then `min(base * 2^(k-1 capped), max_delay)` when
/// exponential backoff is enabled; a constant `base_delay` otherwise.
fn backoff_delay(base: Duration, max: Duration, exponential: bool, consecutive_failures: u32) -> Duration {
    if !exponential {
        return base.min(max);
    }
    let exponent = consecutive_failures.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
    let multiplier = 2u32.saturating_pow(exponent);
    base.checked_mul(multiplier).unwrap_or(max).min(max)
}

/// One open -> (maybe detect) -> line loop session. Returns why it ended.
fn run_one_session(
    spec: &PortSpec,
    detection: &DetectionConfig,
    sink: &Arc<DualSink>,
    gate: &Arc<BrokerGate>,
    events: &EventPublisher,
    stats: &Arc<Mutex<ChannelStats>>,
    cancel: &CancellationToken,
    reconnect_requested: &Arc<AtomicBool>,
) -> SessionOutcome {
    set_state(stats, ChannelState::Detecting);

    let open_baud = spec.baud.unwrap_or_else(|| detection.baud_rates.first().copied().unwrap_or(9600));
    let adapter = match SerialAdapter::open(spec, open_baud, false, DETECTION_READ_TIMEOUT) {
        Ok(a) => a,
        Err(_) => return SessionOutcome::HardError,
    };

    let final_baud = match spec.baud {
        Some(b) => b,
        None => {
            let timeout = Duration::from_secs(detection.detection_timeout_sec.max(1));
            match autobaud::detect(&adapter, &detection.baud_rates, timeout, detection.min_bytes_for_valid) {
                Some(result) => {
                    stats.lock().baud = Some(result.baud);
                    events.publish(
                        EventType::BaudDetected,
                        Some(&spec.designation),
                        Some(&spec.device_path),
                        None,
                        Some(json!({ "baud": result.baud, "ascii_ratio": result.ascii_ratio, "bytes_sampled": result.bytes_sampled })),
                    );
                    result.baud
                }
                None => {
                    adapter.close();
                    return SessionOutcome::HardError;
                }
            }
        }
    };

    // Detection left the adapter at final_baud when auto-detecting; when
    // the spec pins a baud we opened at that baud directly, so no-op.
    let _ = adapter.set_baud(final_baud);

    // Flow control: pinned by config, or inferred from CTS (auto). Changing
    // flow control in place can fail on some driver/platform combinations;
    // fall back to a full close/reopen when it does (spec.md §9: baud
    // changes prefer in-place, flow control changes may require reopen).
    let flow_control = spec.flow_control.unwrap_or_else(|| adapter.modem_lines().cts);
    let adapter = if flow_control {
        match adapter.set_flow_control(true) {
            Ok(()) => adapter,
            Err(_) => {
                adapter.close();
                match SerialAdapter::open(spec, final_baud, true, PRODUCTION_READ_TIMEOUT) {
                    Ok(a) => a,
                    Err(_) => return SessionOutcome::HardError,
                }
            }
        }
    } else {
        adapter
    };

    if adapter.set_read_timeout(PRODUCTION_READ_TIMEOUT).is_err() {
        adapter.close();
        return SessionOutcome::HardError;
    }

    {
        let mut s = stats.lock();
        s.flow_control = Some(flow_control);
        s.consecutive_failures = 0;
        s.modem_lines = Some(adapter.modem_lines());
    }
    set_state(stats, ChannelState::Running);

    let mut reader = LineReader::new();
    let mut buf = [0u8; 4096];

    loop {
        if cancel.is_cancelled() {
            adapter.close();
            return SessionOutcome::Stopped;
        }

        if reconnect_requested.swap(false, Ordering::SeqCst) {
            adapter.close();
            return SessionOutcome::Reconnect;
        }

        if !gate.is_up() {
            set_state(stats, ChannelState::WaitingForBroker);
            match gate.await_up_blocking(cancel) {
                AwaitOutcome::Cancelled => {
                    adapter.close();
                    return SessionOutcome::Stopped;
                }
                AwaitOutcome::Up => set_state(stats, ChannelState::Running),
            }
            continue;
        }

        match adapter.read_into(&mut buf) {
            ReadOutcome::Timeout => continue,
            ReadOutcome::Bytes(n) => {
                stats.lock().bytes_in += n as u64;
                for outcome in reader.feed(&buf[..n]) {
                    match outcome {
                        LineOutcome::Line(line) => {
                            let ts = Utc::now();
                            let record = build_record(
                                spec.fips.as_deref().unwrap_or(""),
                                &spec.designation,
                                ts,
                                &line,
                            );
                            match sink.write_line(&record) {
                                Ok(SinkOutcome::Ok) => {}
                                Ok(SinkOutcome::BrokerPublishFailed) => {
                                    stats.lock().broker_publish_failures += 1;
                                }
                                Err(_) => {
                                    stats.lock().errors += 1;
                                }
                            }
                            let mut s = stats.lock();
                            s.lines_in += 1;
                            s.last_line_time = Some(ts);
                        }
                        LineOutcome::TooLong(len) => {
                            stats.lock().errors += 1;
                            warn!(device = %spec.device_path, bytes = len, "line exceeded max length, dropped");
                        }
                    }
                }
            }
            ReadOutcome::Eof | ReadOutcome::Error(_) => {
                adapter.close();
                return SessionOutcome::Reconnect;
            }
        }
    }
}
