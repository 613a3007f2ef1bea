//! Response returned by a completed request.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

/// One decoded response frame plus timing.
///
/// The payload is owned by the response; callers get a shared slice or take
/// it out with [`into_payload`](Self::into_payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    payload: Vec<u8>,
    rtt: Duration,
    remote_addr: Option<SocketAddr>,
    request_start: SystemTime,
    response_received: SystemTime,
}

impl Response {
    /// Assemble a response.
    pub fn new(
        payload: Vec<u8>,
        rtt: Duration,
        remote_addr: Option<SocketAddr>,
        request_start: SystemTime,
        response_received: SystemTime,
    ) -> Self {
        Self {
            payload,
            rtt,
            remote_addr,
            request_start,
            response_received,
        }
    }

    /// Frame payload, framing stripped.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Take the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Time from first write to frame decoded.
    pub fn rtt(&self) -> Duration {
        self.rtt
    }

    /// Peer address of the session that answered.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Wall-clock time the request started.
    pub fn request_start(&self) -> SystemTime {
        self.request_start
    }

    /// Wall-clock time the response was decoded.
    pub fn response_received(&self) -> SystemTime {
        self.response_received
    }
}
