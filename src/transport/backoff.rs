//! Capped exponential backoff with symmetric jitter.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff for connect retries.
///
/// Each call to [`next_delay`](Self::next_delay) returns the current base
/// scaled by a random factor in `[1 - jitter, 1 + jitter]`, then doubles the
/// base (saturating, capped at `max`).
///
/// A `Backoff` belongs to one retry loop and is not shared.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
    jitter: f64,
}

impl Backoff {
    /// Create a backoff starting at `initial`, never exceeding `max` before
    /// jitter. `jitter` is clamped to `[0, 1]`; a non-finite value disables it.
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        let jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            current: initial.min(max),
            max,
            jitter,
        }
    }

    /// Unjittered delay the next call will be based on.
    pub fn base(&self) -> Duration {
        self.current
    }

    /// Ceiling of the unjittered base.
    pub fn max(&self) -> Duration {
        self.max
    }

    /// Jitter factor in `[0, 1]`.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Return the next delay and advance the base.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let delay = if self.jitter > 0.0 {
            let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            base.mul_f64(factor.max(0.0))
        } else {
            base
        };

        let doubled = (base.as_millis() as u64).saturating_mul(2);
        self.current = Duration::from_millis(doubled).min(self.max);
        delay
    }

    /// Restart from `initial`.
    pub fn reset(&mut self, initial: Duration) {
        self.current = initial.min(self.max);
    }
}
