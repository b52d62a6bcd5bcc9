//! Broker Availability Gate (C4)
//!
//! Single source of truth for "is the downstream broker reachable". Only
//! the broker client's own connection-event callbacks write this; every
//! channel only reads it. Mirrors the shape of the grounding project's
//! `shutdown: Arc<AtomicBool>` propagated to transports, but inverted
//! (true = up, not true = stop) and polled rather than checked once per
//! loop turn.

use crate::constants::GATE_POLL_INTERVAL;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

#[derive(Debug, PartialEq, Eq)]
pub enum AwaitOutcome {
    Up,
    Cancelled,
}

pub struct BrokerGate {
    up: AtomicBool,
}

impl BrokerGate {
    pub fn new() -> Self {
        Self {
            up: AtomicBool::new(false),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// Async park, for callers already on the tokio runtime (Health
    /// Publisher, Forwarder).
    pub async fn await_up(&self, cancel: &CancellationToken) -> AwaitOutcome {
        loop {
            if self.is_up() {
                return AwaitOutcome::Up;
            }
            tokio::select! {
                _ = cancel.cancelled() => return AwaitOutcome::Cancelled,
                _ = tokio::time::sleep(GATE_POLL_INTERVAL) => {}
            }
        }
    }

    /// Blocking park, for the Serial Channel's dedicated OS thread — the
    /// line loop never reads from the port while parked here (I3).
    pub fn await_up_blocking(&self, cancel: &CancellationToken) -> AwaitOutcome {
        loop {
            if self.is_up() {
                return AwaitOutcome::Up;
            }
            if cancel.is_cancelled() {
                return AwaitOutcome::Cancelled;
            }
            std::thread::sleep(GATE_POLL_INTERVAL);
        }
    }
}

impl Default for BrokerGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_down() {
        let gate = BrokerGate::new();
        assert!(!gate.is_up());
    }

    #[test]
    fn set_up_toggles() {
        let gate = BrokerGate::new();
        gate.set_up(true);
        assert!(gate.is_up());
        gate.set_up(false);
        assert!(!gate.is_up());
    }

    #[test]
    fn blocking_await_returns_immediately_when_up() {
        let gate = BrokerGate::new();
        gate.set_up(true);
        let cancel = CancellationToken::new();
        assert_eq!(gate.await_up_blocking(&cancel), AwaitOutcome::Up);
    }

    #[test]
    fn blocking_await_returns_cancelled_without_waiting_full_poll_period() {
        let gate = BrokerGate::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let start = std::time::Instant::now();
        assert_eq!(gate.await_up_blocking(&cancel), AwaitOutcome::Cancelled);
        assert!(start.elapsed() < GATE_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn async_await_up_unblocks_when_gate_flips() {
        let gate = std::sync::Arc::new(BrokerGate::new());
        let cancel = CancellationToken::new();
        let gate2 = gate.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            gate2.set_up(true);
        });
        assert_eq!(gate.await_up(&cancel).await, AwaitOutcome::Up);
    }
}
