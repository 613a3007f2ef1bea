//! Connection events.
//!
//! Engines and the client report lifecycle changes, traffic, failures and
//! retry decisions as [`Event`] values. An [`EventDispatcher`] forwards them,
//! in production order, to the configured [`EventListener`] through a
//! [`Dispatch`] executor.

mod dispatch;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

pub use dispatch::{Dispatch, InlineDispatch, Job, ThreadDispatch};

use crate::core::ClientError;
use crate::transport::{ConnectionState, Metrics, StateInfo, TrafficEvent};

/// Phase in which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorStage {
    /// Host name resolution.
    Dns,
    /// TCP connect.
    Connect,
    /// TLS handshake or post-handshake verification.
    Handshake,
    /// Reading or writing frames.
    Io,
    /// Closing the transport.
    Close,
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorStage::Dns => "dns",
            ErrorStage::Connect => "connect",
            ErrorStage::Handshake => "handshake",
            ErrorStage::Io => "io",
            ErrorStage::Close => "close",
        };
        f.write_str(name)
    }
}

/// Something observable happened on a client.
#[derive(Debug, Clone)]
pub enum Event {
    /// The connection moved to a new state.
    StateChanged {
        /// New state.
        state: ConnectionState,
        /// Context for the transition.
        info: StateInfo,
    },
    /// Bytes moved on the socket.
    Traffic(TrafficEvent),
    /// An operation failed.
    Error {
        /// Where it failed.
        stage: ErrorStage,
        /// The failure.
        error: ClientError,
    },
    /// A connect attempt failed and another is scheduled.
    RetryScheduled {
        /// 1-based number of the attempt that failed.
        attempt: u32,
        /// Delay before the next attempt.
        backoff: Duration,
        /// Failure of the attempt.
        cause: ClientError,
    },
    /// No connect attempts remain.
    RetryExhausted {
        /// Failure of the final attempt.
        last_error: ClientError,
    },
}

/// Receives client events.
///
/// Any `Fn(&Event) + Send + Sync` closure is a listener.
pub trait EventListener: Send + Sync {
    /// Handle one event.
    fn on_event(&self, event: &Event);
}

impl<F> EventListener for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

/// Fans events out to the listener and keeps client-side bookkeeping
/// (current state, traffic counters).
pub struct EventDispatcher {
    label: String,
    listener: Option<Arc<dyn EventListener>>,
    dispatch: Arc<dyn Dispatch>,
    metrics: Metrics,
    state: Mutex<ConnectionState>,
}

impl EventDispatcher {
    /// Create a dispatcher.
    pub fn new(
        label: impl Into<String>,
        listener: Option<Arc<dyn EventListener>>,
        dispatch: Arc<dyn Dispatch>,
    ) -> Self {
        Self {
            label: label.into(),
            listener,
            dispatch,
            metrics: Metrics::new(),
            state: Mutex::new(ConnectionState::Idle),
        }
    }

    /// Dispatcher with no listener.
    pub fn silent(label: impl Into<String>) -> Self {
        Self::new(label, None, Arc::new(InlineDispatch))
    }

    /// Most recently reported state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Traffic counters.
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Report a state transition.
    pub fn state_changed(&self, state: ConnectionState, info: StateInfo) {
        *self.state.lock() = state;
        tracing::debug!(client = %self.label, %state, retry = info.retry, "state changed");
        self.emit(Event::StateChanged { state, info });
    }

    /// Report traffic.
    pub fn traffic(&self, traffic: TrafficEvent) {
        self.metrics.record_traffic(&traffic);
        tracing::trace!(
            client = %self.label,
            direction = ?traffic.direction,
            bytes = traffic.bytes,
            "traffic"
        );
        self.emit(Event::Traffic(traffic));
    }

    /// Report a failure.
    pub fn error(&self, stage: ErrorStage, error: &ClientError) {
        tracing::warn!(client = %self.label, %stage, %error, "operation failed");
        self.emit(Event::Error {
            stage,
            error: error.clone(),
        });
    }

    /// Report a scheduled connect retry.
    pub fn retry_scheduled(&self, attempt: u32, backoff: Duration, cause: &ClientError) {
        tracing::info!(
            client = %self.label,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            cause = %cause,
            "connect retry scheduled"
        );
        self.emit(Event::RetryScheduled {
            attempt,
            backoff,
            cause: cause.clone(),
        });
    }

    /// Report that connect retries are exhausted.
    pub fn retry_exhausted(&self, last_error: &ClientError) {
        tracing::error!(client = %self.label, error = %last_error, "connect retries exhausted");
        self.emit(Event::RetryExhausted {
            last_error: last_error.clone(),
        });
    }

    fn emit(&self, event: Event) {
        if let Some(listener) = &self.listener {
            let listener = Arc::clone(listener);
            self.dispatch
                .dispatch(Box::new(move || listener.on_event(&event)));
        }
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("label", &self.label)
            .field("has_listener", &self.listener.is_some())
            .field("dispatch", &self.dispatch)
            .field("state", &self.state())
            .finish()
    }
}
