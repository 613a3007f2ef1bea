//! Error types for the isosocket client.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by a framer while encoding or decoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Framer constructed with unusable parameters.
    #[error("invalid framer parameters: {0}")]
    InvalidParameters(&'static str),

    /// Payload does not fit the length header.
    #[error("payload of {len} bytes exceeds the {max} byte limit of the length header")]
    PayloadTooLarge {
        /// Payload length.
        len: usize,
        /// Largest encodable payload.
        max: usize,
    },

    /// Fixed-size framing received a payload of the wrong size.
    #[error("payload must be exactly {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Configured frame size.
        expected: usize,
        /// Actual payload size.
        actual: usize,
    },

    /// Delimiter framing cannot carry its own sentinel byte.
    #[error("payload contains the frame delimiter 0x{0:02x}")]
    DelimiterInPayload(u8),

    /// Inbound bytes can never form a valid frame.
    #[error("malformed inbound frame: {0}")]
    Malformed(&'static str),
}

/// Errors in the TLS layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TlsError {
    /// The trust evaluator rejected the certificate chain.
    #[error("server certificate not trusted: {0}")]
    Unverified(String),

    /// Post-handshake hostname verification failed.
    #[error("hostname verification failed for {0}")]
    HostnameMismatch(String),

    /// None of the chain's SPKI digests matched a configured pin.
    #[error("SPKI pinning failure: no matching pin found")]
    PinningMismatch,

    /// The configured host is not a valid TLS server name.
    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    /// The TLS context could not be built.
    #[error("failed to build TLS context: {0}")]
    Context(String),

    /// Any other failure reported by the TLS session.
    #[error("TLS protocol error: {0}")]
    Protocol(String),
}

/// Configuration errors. Always fatal, raised at build time.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Host is empty or whitespace.
    #[error("host must not be empty")]
    EmptyHost,

    /// Port outside [1, 65535].
    #[error("port must be in 1..=65535, got {0}")]
    InvalidPort(u16),

    /// A timeout was set to zero.
    #[error("{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    /// Retries enabled with nothing to retry on.
    #[error("connect retry is enabled but the retryable error set is empty")]
    EmptyRetrySet,

    /// Max attempts must be at least one.
    #[error("connect max attempts must be at least 1")]
    ZeroAttempts,

    /// A backoff bound was zero.
    #[error("{0} must be greater than zero")]
    ZeroBackoff(&'static str),

    /// Jitter factor is NaN or infinite.
    #[error("jitter factor must be finite, got {0}")]
    InvalidJitter(f64),

    /// A concurrency limit was zero.
    #[error("{0} must be at least 1")]
    ZeroLimit(&'static str),

    /// A pin is not base64 of a 32-byte SHA-256 digest.
    #[error("invalid SPKI pin {0:?}: expected base64 of a SHA-256 digest")]
    InvalidPin(String),

    /// Unknown TLS protocol version label.
    #[error("unsupported TLS protocol version {0:?}")]
    UnsupportedTlsVersion(String),
}

/// Connect failure categories, used only to decide retry eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectErrorKind {
    /// TCP connect (or a socket operation) timed out.
    Timeout,
    /// Host name could not be resolved.
    DnsFailure,
    /// Network or host unreachable.
    NetworkUnreachable,
    /// Peer actively refused the connection.
    ConnectionRefused,
    /// TLS handshake exceeded its deadline.
    HandshakeTimeout,
    /// Certificate chain or hostname not trusted.
    TlsUnverified,
    /// Certificate chain did not match any pin.
    TlsPinningMismatch,
    /// Anything else.
    Unknown,
}

impl ConnectErrorKind {
    /// Categories retried when no explicit set is configured.
    pub const DEFAULT_RETRYABLE: [Self; 5] = [
        Self::Timeout,
        Self::DnsFailure,
        Self::NetworkUnreachable,
        Self::ConnectionRefused,
        Self::HandshakeTimeout,
    ];

    /// Derive the category of a connect failure.
    pub fn classify(error: &ClientError) -> Self {
        match error {
            ClientError::ConnectTimeout { .. } => Self::Timeout,
            ClientError::Dns { .. } => Self::DnsFailure,
            ClientError::HandshakeTimeout(_) => Self::HandshakeTimeout,
            ClientError::Tls(TlsError::PinningMismatch) => Self::TlsPinningMismatch,
            ClientError::Tls(TlsError::Unverified(_) | TlsError::HostnameMismatch(_)) => {
                Self::TlsUnverified
            }
            ClientError::Connect { source, .. } | ClientError::Io(source) => Self::from_io(source),
            ClientError::RetriesExhausted { last, .. } => Self::classify(last),
            _ => Self::Unknown,
        }
    }

    fn from_io(error: &io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Self::Timeout,
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
                Self::NetworkUnreachable
            }
            _ => Self::Unknown,
        }
    }
}

/// Top-level client errors.
///
/// `Clone` so that the same failure can be handed to the caller and to the
/// event listener; I/O errors are shared behind an `Arc`.
#[derive(Debug, Error, Clone)]
pub enum ClientError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// DNS resolution failed or returned no address.
    #[error("failed to resolve {host}: {source}")]
    Dns {
        /// Host being resolved.
        host: String,
        /// Underlying resolver error.
        source: Arc<io::Error>,
    },

    /// TCP connect did not complete before the connect timeout.
    #[error("connect to {addr} timed out after {timeout:?}")]
    ConnectTimeout {
        /// Remote address.
        addr: SocketAddr,
        /// Configured connect timeout.
        timeout: Duration,
    },

    /// TCP connect failed.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Remote address.
        addr: SocketAddr,
        /// Underlying socket error.
        source: Arc<io::Error>,
    },

    /// TLS handshake did not finish before the handshake timeout.
    #[error("TLS handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// TLS failure.
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// `send_and_receive` called before the connection is ready.
    #[error("client is not ready")]
    NotReady,

    /// No request queue slot became free in time.
    #[error("request queue timeout after {0:?}")]
    QueueTimeout(Duration),

    /// The request did not complete in time.
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Socket read timed out.
    #[error("read timed out")]
    ReadTimeout,

    /// Socket write timed out.
    #[error("write timed out")]
    WriteTimeout,

    /// Peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The client has been closed.
    #[error("client is closed")]
    ClientClosed,

    /// Framing failure.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Other I/O failure.
    #[error("i/o error: {0}")]
    Io(Arc<io::Error>),

    /// The client must be created inside a tokio runtime.
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// All connect attempts failed.
    #[error("connect retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts performed.
        attempts: u32,
        /// Failure of the last attempt.
        last: Box<ClientError>,
    },
}

impl From<io::Error> for ClientError {
    fn from(error: io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

impl ClientError {
    /// Category of this error for retry decisions.
    pub fn connect_kind(&self) -> ConnectErrorKind {
        ConnectErrorKind::classify(self)
    }

    /// Whether this failure leaves the transport unusable.
    ///
    /// Such failures tear the session down and may trigger auto-reconnect.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::ConnectionClosed
                | ClientError::ReadTimeout
                | ClientError::WriteTimeout
                | ClientError::Tls(_)
                | ClientError::Frame(FrameError::Malformed(_))
        )
    }

    /// Whether this is one of the timeout variants.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ClientError::ConnectTimeout { .. }
                | ClientError::HandshakeTimeout(_)
                | ClientError::QueueTimeout(_)
                | ClientError::RequestTimeout(_)
                | ClientError::ReadTimeout
                | ClientError::WriteTimeout
        )
    }
}

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;
