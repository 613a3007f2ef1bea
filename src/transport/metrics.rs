//! Running traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::state::{Direction, TrafficEvent};

/// Monotonic counters updated from traffic events and completed requests.
#[derive(Debug, Default)]
pub struct Metrics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    requests: AtomicU64,
    last_rtt_micros: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    /// Total bytes written.
    pub bytes_sent: u64,
    /// Total bytes read.
    pub bytes_received: u64,
    /// Completed requests.
    pub requests: u64,
    /// Round-trip time of the most recent request.
    pub last_rtt: Option<Duration>,
}

impl Metrics {
    /// Fresh counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Account a traffic event.
    pub fn record_traffic(&self, event: &TrafficEvent) {
        let counter = match event.direction {
            Direction::Sent => &self.bytes_sent,
            Direction::Received => &self.bytes_received,
        };
        counter.fetch_add(event.bytes as u64, Ordering::Relaxed);
    }

    /// Account a completed request.
    pub fn record_rtt(&self, rtt: Duration) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        // Zero is reserved for "no sample".
        let micros = (rtt.as_micros() as u64).max(1);
        self.last_rtt_micros.store(micros, Ordering::Relaxed);
    }

    /// Copy the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let rtt = self.last_rtt_micros.load(Ordering::Relaxed);
        MetricsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            last_rtt: (rtt != 0).then(|| Duration::from_micros(rtt)),
        }
    }
}
