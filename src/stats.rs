//! Packet counters and activity tracking
//!
//! Counters use relaxed atomic ordering; exact cross-counter consistency is
//! not required. Gauges (origins, clients, flows) are derived on demand from
//! the tables and combined into [`StatsSnapshot`] by the proxy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Monotonic packet and failure counters owned by one proxy instance
#[derive(Debug, Default)]
pub(crate) struct ProxyStats {
    /// IP packets successfully handed to the stack
    accepted_packets: AtomicU64,
    /// Packets the stack rejected plus flows dropped on dial failure
    rejected_packets: AtomicU64,
    /// Upstream dials that failed
    dial_failures: AtomicU64,
}

impl ProxyStats {
    pub(crate) fn accepted_packet(&self) {
        self.accepted_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn rejected_packet(&self) {
        self.rejected_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn accepted_packets(&self) -> u64 {
        self.accepted_packets.load(Ordering::Relaxed)
    }

    pub(crate) fn rejected_packets(&self) -> u64 {
        self.rejected_packets.load(Ordering::Relaxed)
    }

    pub(crate) fn dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }
}

/// Point-in-time copy of all counters and gauges
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// IP packets successfully handed to the stack
    pub accepted_packets: u64,
    /// Packets rejected by the stack or dropped on dial failure
    pub rejected_packets: u64,
    /// Upstream dials that failed
    pub dial_failures: u64,
    /// Current number of TCP origins
    pub num_tcp_origins: usize,
    /// Current number of TCP clients across all origins
    pub num_tcp_clients: usize,
    /// Current number of UDP flows
    pub num_udp_flows: usize,
}

/// Last-activity timestamp shared between a flow's relay tasks and the reaper
///
/// Touched on every successful byte transfer; the reaper compares
/// `idle_for` against the idle timeout. Monotonic clock only.
#[derive(Debug)]
pub(crate) struct Activity(parking_lot::Mutex<Instant>);

impl Activity {
    pub(crate) fn new() -> Self {
        Self(parking_lot::Mutex::new(Instant::now()))
    }

    #[inline]
    pub(crate) fn touch(&self) {
        *self.0.lock() = Instant::now();
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.0.lock().elapsed()
    }
}
