//! Client configuration and its builder.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::constants;
use crate::core::{ConfigError, ConnectErrorKind};
use crate::events::{Dispatch, EventListener, ThreadDispatch};
use crate::framing::{Framer, LengthPrefixedFramer};
use crate::tls::TlsOptions;
use crate::transport::{Backoff, SocketOptions};

/// Which I/O engine drives the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EngineMode {
    /// std sockets on the blocking thread pool.
    #[default]
    Blocking,
    /// tokio readiness with an explicit TLS handshake loop.
    NonBlocking,
}

/// Operation timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// TCP connect.
    pub connect: Duration,
    /// Socket read.
    pub read: Duration,
    /// Socket write.
    pub write: Duration,
    /// TLS handshake.
    pub handshake: Duration,
    /// Default bound for a whole request, queueing included.
    pub request: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: constants::CONNECT_TIMEOUT,
            read: constants::READ_TIMEOUT,
            write: constants::WRITE_TIMEOUT,
            handshake: constants::HANDSHAKE_TIMEOUT,
            request: constants::REQUEST_TIMEOUT,
        }
    }
}

/// Connect retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retry at all.
    pub enabled: bool,
    /// Attempts including the first.
    pub max_attempts: u32,
    /// First backoff delay.
    pub initial_backoff: Duration,
    /// Backoff ceiling.
    pub max_backoff: Duration,
    /// Symmetric jitter factor, clamped to [0, 1].
    pub jitter: f64,
    /// Failure categories worth retrying.
    pub retry_on: HashSet<ConnectErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: constants::CONNECT_MAX_ATTEMPTS,
            initial_backoff: constants::CONNECT_INITIAL_BACKOFF,
            max_backoff: constants::CONNECT_MAX_BACKOFF,
            jitter: constants::CONNECT_JITTER,
            retry_on: ConnectErrorKind::DEFAULT_RETRYABLE.into_iter().collect(),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a failure of this category may be retried.
    pub fn is_retryable(&self, kind: ConnectErrorKind) -> bool {
        self.enabled && self.retry_on.contains(&kind)
    }

    /// Fresh backoff for one retry loop.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.initial_backoff, self.max_backoff, self.jitter)
    }
}

/// Request concurrency limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Sends executing at once.
    pub max_in_flight: usize,
    /// Requests admitted (waiting or executing) at once.
    pub queue_capacity: usize,
    /// Minimum spacing between request starts.
    pub min_inter_request_delay: Option<Duration>,
    /// Inbound bytes buffered for one response before it is rejected.
    pub max_frame_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_in_flight: constants::MAX_IN_FLIGHT,
            queue_capacity: constants::REQUEST_QUEUE_CAPACITY,
            min_inter_request_delay: None,
            max_frame_size: constants::MAX_FRAME_SIZE,
        }
    }
}

/// Immutable client configuration.
///
/// Build it with [`ClientConfig::builder`]; the client shares it read-only.
#[derive(Clone)]
pub struct ClientConfig {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// I/O engine.
    pub mode: EngineMode,
    /// Timeouts.
    pub timeouts: Timeouts,
    /// Kernel socket options.
    pub socket: SocketOptions,
    /// Connect retry policy.
    pub retry: RetryPolicy,
    /// Reconnect in the background after a transport failure.
    pub auto_reconnect: bool,
    /// Concurrency limits.
    pub limits: Limits,
    /// Wire framing.
    pub framer: Arc<dyn Framer>,
    /// TLS settings.
    pub tls: TlsOptions,
    /// Event sink.
    pub listener: Option<Arc<dyn EventListener>>,
    /// Executor for listener callbacks.
    pub dispatch: Arc<dyn Dispatch>,
    /// Recorded on every log span of the client.
    pub label: String,
}

impl ClientConfig {
    /// Start a builder for `host:port`.
    pub fn builder(host: impl Into<String>, port: u16) -> ClientConfigBuilder {
        ClientConfigBuilder::new(host, port)
    }

    /// `host:port`, as handed to the resolver.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check every invariant.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        let timeouts = [
            ("connect timeout", self.timeouts.connect),
            ("read timeout", self.timeouts.read),
            ("write timeout", self.timeouts.write),
            ("handshake timeout", self.timeouts.handshake),
            ("request timeout", self.timeouts.request),
        ];
        if let Some(&(name, _)) = timeouts.iter().find(|(_, t)| t.is_zero()) {
            return Err(ConfigError::ZeroTimeout(name));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if retry.enabled && retry.retry_on.is_empty() {
            return Err(ConfigError::EmptyRetrySet);
        }
        if retry.initial_backoff.is_zero() {
            return Err(ConfigError::ZeroBackoff("initial backoff"));
        }
        if retry.max_backoff.is_zero() {
            return Err(ConfigError::ZeroBackoff("max backoff"));
        }
        if !retry.jitter.is_finite() {
            return Err(ConfigError::InvalidJitter(retry.jitter));
        }

        if self.limits.max_in_flight == 0 {
            return Err(ConfigError::ZeroLimit("max in-flight requests"));
        }
        if self.limits.queue_capacity == 0 {
            return Err(ConfigError::ZeroLimit("request queue capacity"));
        }
        if self.limits.max_frame_size == 0 {
            return Err(ConfigError::ZeroLimit("max frame size"));
        }

        self.tls.validate()
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("mode", &self.mode)
            .field("timeouts", &self.timeouts)
            .field("socket", &self.socket)
            .field("retry", &self.retry)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("limits", &self.limits)
            .field("framer", &self.framer)
            .field("tls", &self.tls)
            .field("has_listener", &self.listener.is_some())
            .field("dispatch", &self.dispatch)
            .field("label", &self.label)
            .finish()
    }
}

/// Builder for [`ClientConfig`].
pub struct ClientConfigBuilder {
    host: String,
    port: u16,
    mode: EngineMode,
    timeouts: Timeouts,
    socket: SocketOptions,
    retry: RetryPolicy,
    auto_reconnect: bool,
    limits: Limits,
    framer: Option<Arc<dyn Framer>>,
    tls: TlsOptions,
    listener: Option<Arc<dyn EventListener>>,
    dispatch: Option<Arc<dyn Dispatch>>,
    label: Option<String>,
}

impl ClientConfigBuilder {
    /// Builder with defaults for `host:port`.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            mode: EngineMode::default(),
            timeouts: Timeouts::default(),
            socket: SocketOptions::default(),
            retry: RetryPolicy::default(),
            auto_reconnect: false,
            limits: Limits::default(),
            framer: None,
            tls: TlsOptions::default(),
            listener: None,
            dispatch: None,
            label: None,
        }
    }

    /// Select the I/O engine.
    pub fn mode(mut self, mode: EngineMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace all timeouts.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// TCP connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect = timeout;
        self
    }

    /// Socket read timeout.
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.read = timeout;
        self
    }

    /// Socket write timeout.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.write = timeout;
        self
    }

    /// TLS handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.handshake = timeout;
        self
    }

    /// Default request timeout.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request = timeout;
        self
    }

    /// Kernel socket options.
    pub fn socket_options(mut self, socket: SocketOptions) -> Self {
        self.socket = socket;
        self
    }

    /// Connect retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reconnect in the background after a transport failure.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Concurrency limits.
    pub fn limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Wire framing. Defaults to a 2-byte big-endian length prefix.
    pub fn framer(mut self, framer: impl Framer + 'static) -> Self {
        self.framer = Some(Arc::new(framer));
        self
    }

    /// Wire framing, shared.
    pub fn shared_framer(mut self, framer: Arc<dyn Framer>) -> Self {
        self.framer = Some(framer);
        self
    }

    /// TLS settings.
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Event listener.
    pub fn listener(mut self, listener: impl EventListener + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Executor for listener callbacks. Defaults to [`ThreadDispatch`].
    pub fn dispatch(mut self, dispatch: impl Dispatch + 'static) -> Self {
        self.dispatch = Some(Arc::new(dispatch));
        self
    }

    /// Label recorded on log spans. Defaults to `host:port`.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let host = self.host.trim().to_string();
        let label = self
            .label
            .unwrap_or_else(|| format!("{}:{}", host, self.port));
        let config = ClientConfig {
            host,
            port: self.port,
            mode: self.mode,
            timeouts: self.timeouts,
            socket: self.socket,
            retry: self.retry,
            auto_reconnect: self.auto_reconnect,
            limits: self.limits,
            framer: self
                .framer
                .unwrap_or_else(|| Arc::new(LengthPrefixedFramer::default())),
            tls: self.tls,
            listener: self.listener,
            dispatch: self
                .dispatch
                .unwrap_or_else(|| Arc::new(ThreadDispatch::new())),
            label,
        };
        config.validate()?;
        Ok(config)
    }
}

impl fmt::Debug for ClientConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfigBuilder")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
