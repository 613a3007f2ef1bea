//! Minimum spacing between consecutive requests.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// What the pacer wants before the next send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacerAction {
    /// Send immediately.
    SendNow,
    /// Wait until the given instant.
    WaitUntil(Instant),
}

/// Enforces a minimum delay between request starts.
///
/// The last send instant is shared by every request of a client and guarded
/// by an async mutex, so concurrent senders are spaced one after another.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Option<Duration>,
    last_sent: Mutex<Option<Instant>>,
}

impl RequestPacer {
    /// Create a pacer. `None` (or a zero interval) disables pacing.
    pub fn new(min_interval: Option<Duration>) -> Self {
        Self {
            min_interval: min_interval.filter(|d| !d.is_zero()),
            last_sent: Mutex::new(None),
        }
    }

    /// Configured interval, if pacing is active.
    pub fn min_interval(&self) -> Option<Duration> {
        self.min_interval
    }

    /// Decide what to do given the previous send instant.
    pub fn poll(&self, last_sent: Option<Instant>, now: Instant) -> PacerAction {
        match (self.min_interval, last_sent) {
            (Some(interval), Some(last)) if now < last + interval => {
                PacerAction::WaitUntil(last + interval)
            }
            _ => PacerAction::SendNow,
        }
    }

    /// Wait out the remaining interval, then record this send.
    pub async fn pace(&self) {
        if self.min_interval.is_none() {
            return;
        }
        let mut last_sent = self.last_sent.lock().await;
        if let PacerAction::WaitUntil(deadline) = self.poll(*last_sent, Instant::now()) {
            tracing::trace!(wait = ?(deadline - Instant::now()), "pacing request");
            tokio::time::sleep_until(deadline).await;
        }
        *last_sent = Some(Instant::now());
    }
}
