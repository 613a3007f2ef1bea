//! Connection lifecycle states and traffic records.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

/// Lifecycle state of a client connection.
///
/// ```text
/// Idle -> Resolving -> Connecting -> [Handshaking] -> Connected -> Ready
///                                                                   |
///               Ready <- Receiving <- Sending <---------------------+
///
/// any -> Error | BackingOff -> Connecting ...
/// Ready -> Disconnected -> Reconnecting -> Resolving ...
/// any -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Not connected, nothing attempted yet.
    #[default]
    Idle,
    /// Resolving the host name.
    Resolving,
    /// TCP connect in progress.
    Connecting,
    /// TLS handshake in progress.
    Handshaking,
    /// Transport established.
    Connected,
    /// Ready to exchange frames.
    Ready,
    /// Writing a request.
    Sending,
    /// Waiting for the response frame.
    Receiving,
    /// Waiting before the next connect attempt.
    BackingOff,
    /// Background reconnect started after a transport failure.
    Reconnecting,
    /// Transport lost during a request.
    Disconnected,
    /// Client or engine closed.
    Closed,
    /// Last operation failed.
    Error,
}

impl ConnectionState {
    /// Whether a transport is established (including while a request runs).
    pub fn is_connected(self) -> bool {
        matches!(
            self,
            ConnectionState::Connected
                | ConnectionState::Ready
                | ConnectionState::Sending
                | ConnectionState::Receiving
        )
    }

    /// Whether this state is part of an ongoing connect attempt.
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            ConnectionState::Resolving
                | ConnectionState::Connecting
                | ConnectionState::Handshaking
                | ConnectionState::BackingOff
                | ConnectionState::Reconnecting
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "IDLE",
            ConnectionState::Resolving => "RESOLVING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Handshaking => "HANDSHAKING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Ready => "READY",
            ConnectionState::Sending => "SENDING",
            ConnectionState::Receiving => "RECEIVING",
            ConnectionState::BackingOff => "BACKING_OFF",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Closed => "CLOSED",
            ConnectionState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Context attached to a state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StateInfo {
    /// Retry count of the current connect sequence.
    pub retry: u32,
    /// Delay before the next attempt, when backing off.
    pub next_backoff: Option<Duration>,
    /// Remote address, once resolved.
    pub remote: Option<SocketAddr>,
}

impl StateInfo {
    /// Info carrying only a remote address.
    pub fn remote(addr: SocketAddr) -> Self {
        Self {
            remote: Some(addr),
            ..Self::default()
        }
    }

    /// Info for a scheduled retry.
    pub fn backoff(retry: u32, delay: Duration) -> Self {
        Self {
            retry,
            next_backoff: Some(delay),
            remote: None,
        }
    }
}

/// Traffic direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Written to the socket.
    Sent,
    /// Read from the socket.
    Received,
}

/// Bytes moved in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrafficEvent {
    /// Direction of the transfer.
    pub direction: Direction,
    /// Byte count. For TLS sessions this counts plaintext bytes.
    pub bytes: usize,
}

impl TrafficEvent {
    /// Bytes written.
    pub fn sent(bytes: usize) -> Self {
        Self {
            direction: Direction::Sent,
            bytes,
        }
    }

    /// Bytes read.
    pub fn received(bytes: usize) -> Self {
        Self {
            direction: Direction::Received,
            bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_classification() {
        assert!(ConnectionState::Ready.is_connected());
        assert!(ConnectionState::Receiving.is_connected());
        assert!(!ConnectionState::Handshaking.is_connected());
        assert!(ConnectionState::Handshaking.is_connecting());
        assert!(!ConnectionState::Closed.is_connecting());
        assert_eq!(ConnectionState::default(), ConnectionState::Idle);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::BackingOff.to_string(), "BACKING_OFF");
        assert_eq!(ConnectionState::Ready.to_string(), "READY");
    }

    #[test]
    fn test_state_info_constructors() {
        let addr: SocketAddr = "10.0.0.1:5000".parse().unwrap();
        assert_eq!(StateInfo::remote(addr).remote, Some(addr));

        let info = StateInfo::backoff(2, Duration::from_millis(500));
        assert_eq!(info.retry, 2);
        assert_eq!(info.next_backoff, Some(Duration::from_millis(500)));
    }
}
