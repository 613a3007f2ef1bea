//! Connection engines.
//!
//! An [`Engine`] owns one transport (plain TCP or TLS over TCP) and performs
//! a framed request/response exchange on it. Two implementations share the
//! same contract:
//!
//! - [`BlockingEngine`]: std sockets driven on tokio's blocking pool, TLS
//!   through `rustls::StreamOwned`
//! - [`NonBlockingEngine`]: tokio readiness waits with `try_read`/`try_write`
//!   and an explicit TLS handshake loop over a sans-I/O rustls session
//!
//! Both report lifecycle states, traffic and failures through the client's
//! [`EventDispatcher`]. Any failure during connect or during a request tears
//! the transport down, so the next connect starts from scratch.

mod blocking;
mod handshake;
mod nonblocking;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub use blocking::BlockingEngine;
pub use handshake::HandshakeStatus;
pub use nonblocking::NonBlockingEngine;

use crate::client::{ClientConfig, EngineMode};
use crate::core::{ClientError, ClientResult, FrameError};
use crate::events::{ErrorStage, EventDispatcher};
use crate::framing::Framer;
use crate::tls::{TlsContext, tls_error_from_io};
use crate::transport::Response;

/// A single framed transport.
#[async_trait]
pub trait Engine: Send + Sync + fmt::Debug {
    /// Establish the transport. Returns immediately when already ready.
    async fn connect(&self) -> ClientResult<()>;

    /// Whether a transport is established.
    fn is_connected(&self) -> bool;

    /// Whether requests can be sent.
    fn is_ready(&self) -> bool;

    /// Send `payload` as one framed request and return the first complete
    /// response frame, all within `timeout`.
    async fn send_and_receive(&self, payload: &[u8], timeout: Duration) -> ClientResult<Response>;

    /// Close the transport. Further connects fail with
    /// [`ClientError::ClientClosed`].
    async fn close(&self) -> ClientResult<()>;
}

/// Create the engine selected by `config.mode`.
pub fn create(
    config: Arc<ClientConfig>,
    events: Arc<EventDispatcher>,
) -> ClientResult<Arc<dyn Engine>> {
    let tls = if config.tls.enabled {
        Some(TlsContext::build(&config.tls, &config.host)?)
    } else {
        None
    };
    let engine: Arc<dyn Engine> = match config.mode {
        EngineMode::Blocking => Arc::new(BlockingEngine::new(config, tls, events)?),
        EngineMode::NonBlocking => Arc::new(NonBlockingEngine::new(config, tls, events)),
    };
    Ok(engine)
}

/// Collects inbound bytes until the framer yields a frame.
///
/// The first complete frame wins; anything after it in the same read is
/// discarded along with the accumulator. At most `max_size` bytes are held
/// while waiting for a frame.
pub(crate) struct FrameAccumulator {
    framer: Arc<dyn Framer>,
    buffer: Vec<u8>,
    max_size: usize,
}

impl FrameAccumulator {
    pub(crate) fn new(framer: Arc<dyn Framer>, max_size: usize) -> Self {
        let capacity = framer
            .expected_bytes_for_next_frame()
            .unwrap_or(0)
            .min(max_size);
        Self {
            framer,
            buffer: Vec::with_capacity(capacity),
            max_size,
        }
    }

    /// Append `bytes` and try to decode a frame.
    ///
    /// Bytes that can never form a frame fail the request instead of
    /// waiting for the timeout.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Result<Option<Vec<u8>>, FrameError> {
        self.buffer.extend_from_slice(bytes);
        let decoded = self.framer.try_decode(&self.buffer);
        if let Some(frame) = decoded.frames.into_iter().next() {
            self.buffer.drain(..decoded.consumed);
            return Ok(Some(frame));
        }
        match decoded.error {
            Some(error) => Err(error),
            None if self.buffer.len() > self.max_size => Err(FrameError::Malformed(
                "inbound frame exceeds the maximum frame size",
            )),
            None => Ok(None),
        }
    }

    pub(crate) fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Map a socket error, recovering TLS failures and clean EOFs.
pub(crate) fn map_io_error(err: io::Error) -> ClientError {
    if let Some(tls) = tls_error_from_io(&err) {
        return ClientError::Tls(tls);
    }
    match err.kind() {
        io::ErrorKind::UnexpectedEof => ClientError::ConnectionClosed,
        _ => ClientError::from(err),
    }
}

/// Stage an error from the connect path is reported under.
pub(crate) fn connect_stage(error: &ClientError) -> ErrorStage {
    match error {
        ClientError::Dns { .. } => ErrorStage::Dns,
        ClientError::HandshakeTimeout(_) | ClientError::Tls(_) => ErrorStage::Handshake,
        _ => ErrorStage::Connect,
    }
}

pub(crate) fn no_addresses(host: &str) -> ClientError {
    ClientError::Dns {
        host: host.to_string(),
        source: Arc::new(io::Error::new(
            io::ErrorKind::NotFound,
            "no addresses returned",
        )),
    }
}

pub(crate) fn dns_error(host: &str, err: io::Error) -> ClientError {
    ClientError::Dns {
        host: host.to_string(),
        source: Arc::new(err),
    }
}

pub(crate) fn connect_error(addr: SocketAddr, err: io::Error) -> ClientError {
    ClientError::Connect {
        addr,
        source: Arc::new(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{ByteOrder, FixedFramer, LengthPrefixedFramer, LengthWidth, TpduFramer};

    #[test]
    fn test_accumulator_across_reads() {
        let mut acc = FrameAccumulator::new(Arc::new(LengthPrefixedFramer::default()), 1024);
        assert_eq!(acc.push(&[0x00]).unwrap(), None);
        assert_eq!(acc.push(&[0x03, b'a']).unwrap(), None);
        assert_eq!(acc.buffered(), 3);
        assert_eq!(acc.push(b"bc").unwrap(), Some(b"abc".to_vec()));
        assert_eq!(acc.buffered(), 0);
    }

    #[test]
    fn test_accumulator_first_frame_wins() {
        let mut acc = FrameAccumulator::new(Arc::new(FixedFramer::new(2).unwrap()), 1024);
        assert_eq!(acc.push(b"abcd").unwrap(), Some(b"ab".to_vec()));
    }

    #[test]
    fn test_accumulator_fails_fast_on_malformed() {
        let framer =
            TpduFramer::new([0x60, 0x00, 0x01], LengthWidth::Two, ByteOrder::BigEndian).unwrap();
        let mut acc = FrameAccumulator::new(Arc::new(framer), 1024);
        let err = acc.push(&[0x00, 0x01, 0x60, 0x00, 0x02]).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
    }

    #[test]
    fn test_accumulator_caps_buffered_bytes() {
        let framer = LengthPrefixedFramer::new(LengthWidth::Four, ByteOrder::BigEndian, false);
        let mut acc = FrameAccumulator::new(Arc::new(framer), 16);
        // Header announces ~4 GiB; the peer keeps streaming.
        assert_eq!(acc.push(&[0xff, 0xff, 0xff, 0xf0]).unwrap(), None);
        assert_eq!(acc.push(&[0u8; 12]).unwrap(), None);
        let err = acc.push(&[0u8; 1]).unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));

        // A frame that fits the cap is still delivered.
        let framer = LengthPrefixedFramer::new(LengthWidth::Four, ByteOrder::BigEndian, false);
        let mut acc = FrameAccumulator::new(Arc::new(framer), 16);
        assert_eq!(
            acc.push(&[0, 0, 0, 3, b'a', b'b', b'c']).unwrap(),
            Some(b"abc".to_vec())
        );
    }

    #[test]
    fn test_io_error_mapping() {
        assert!(matches!(
            map_io_error(io::Error::from(io::ErrorKind::UnexpectedEof)),
            ClientError::ConnectionClosed
        ));
        assert!(matches!(
            map_io_error(io::Error::from(io::ErrorKind::ConnectionReset)),
            ClientError::Io(_)
        ));
    }

    #[test]
    fn test_connect_stage() {
        assert_eq!(connect_stage(&no_addresses("x")), ErrorStage::Dns);
        assert_eq!(
            connect_stage(&ClientError::HandshakeTimeout(Duration::from_secs(1))),
            ErrorStage::Handshake
        );
        let refused = connect_error(
            "127.0.0.1:1".parse().unwrap(),
            io::Error::from(io::ErrorKind::ConnectionRefused),
        );
        assert_eq!(connect_stage(&refused), ErrorStage::Connect);
    }
}
