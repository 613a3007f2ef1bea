//! Readiness-driven TLS handshake over a sans-I/O rustls session.
//!
//! The driver inspects the session after every step and picks the next one:
//!
//! ```text
//!            ┌──────────── wants_write ────────────┐
//!            v                                     │
//!        NeedWrap ──> NeedUnwrap ──> NeedTask ─────┤
//!        (flush       (read records  (process      │
//!         records)     from socket)   records)     │
//!                                                  v
//!                                              Finished
//! ```

use std::io;

use rustls::ClientConnection;
use tokio::net::TcpStream;
use tokio::time::{Instant, timeout_at};

use crate::core::constants::TLS_RECORD_CAPACITY;
use crate::core::{ClientError, ClientResult};
use crate::tls::map_rustls_error;

/// Next step of a TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Outgoing records are pending.
    NeedWrap,
    /// The session needs more records from the peer.
    NeedUnwrap,
    /// Received records must be processed.
    NeedTask,
    /// The handshake is complete.
    Finished,
}

/// Drives one handshake to completion or failure.
pub(crate) struct HandshakeDriver<'a> {
    conn: &'a mut ClientConnection,
    stream: &'a TcpStream,
    deadline: Instant,
    on_timeout: ClientError,
    inbound: Vec<u8>,
    unprocessed: bool,
}

impl<'a> HandshakeDriver<'a> {
    pub(crate) fn new(
        conn: &'a mut ClientConnection,
        stream: &'a TcpStream,
        deadline: Instant,
        on_timeout: ClientError,
    ) -> Self {
        Self {
            conn,
            stream,
            deadline,
            on_timeout,
            inbound: Vec::new(),
            unprocessed: false,
        }
    }

    pub(crate) fn status(&self) -> HandshakeStatus {
        if self.unprocessed {
            HandshakeStatus::NeedTask
        } else if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.conn.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::Finished
        }
    }

    /// Run the handshake. Returns bytes read past the end of the handshake,
    /// which belong to the application data stream.
    pub(crate) async fn run(mut self) -> ClientResult<Vec<u8>> {
        let mut net = vec![0u8; TLS_RECORD_CAPACITY];
        loop {
            let status = self.status();
            tracing::trace!(?status, "handshake step");
            match status {
                HandshakeStatus::NeedWrap => {
                    flush_records(self.conn, self.stream, self.deadline, &self.on_timeout).await?;
                }
                HandshakeStatus::NeedUnwrap => {
                    if self.inbound.is_empty() {
                        let n = read_some(self.stream, &mut net, self.deadline, &self.on_timeout)
                            .await?;
                        if n == 0 {
                            return Err(ClientError::ConnectionClosed);
                        }
                        if n == net.len() {
                            enlarge(&mut net, TLS_RECORD_CAPACITY * 4);
                        }
                        self.inbound.extend_from_slice(&net[..n]);
                    }
                    let mut pending = &self.inbound[..];
                    let used = self.conn.read_tls(&mut pending)?;
                    self.inbound.drain(..used);
                    self.unprocessed = true;
                }
                HandshakeStatus::NeedTask => {
                    self.unprocessed = false;
                    if let Err(e) = self.conn.process_new_packets() {
                        send_alert(self.conn, self.stream);
                        return Err(ClientError::Tls(map_rustls_error(&e)));
                    }
                }
                HandshakeStatus::Finished => return Ok(self.inbound),
            }
        }
    }
}

/// Double `buf`, up to `limit`. Returns whether it grew.
pub(crate) fn enlarge(buf: &mut Vec<u8>, limit: usize) -> bool {
    if buf.len() >= limit {
        return false;
    }
    let size = (buf.len() * 2).clamp(1, limit);
    buf.resize(size, 0);
    true
}

/// Write every pending TLS record to the socket.
pub(crate) async fn flush_records(
    conn: &mut ClientConnection,
    stream: &TcpStream,
    deadline: Instant,
    on_timeout: &ClientError,
) -> ClientResult<()> {
    let mut out = Vec::with_capacity(TLS_RECORD_CAPACITY);
    while conn.wants_write() {
        out.clear();
        conn.write_tls(&mut out)?;
        write_all(stream, &out, deadline, on_timeout).await?;
    }
    Ok(())
}

/// Write `data` fully, waiting for writability up to `deadline`.
pub(crate) async fn write_all(
    stream: &TcpStream,
    mut data: &[u8],
    deadline: Instant,
    on_timeout: &ClientError,
) -> ClientResult<()> {
    while !data.is_empty() {
        timeout_at(deadline, stream.writable())
            .await
            .map_err(|_| on_timeout.clone())??;
        match stream.try_write(data) {
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read whatever is available, waiting for readability up to `deadline`.
pub(crate) async fn read_some(
    stream: &TcpStream,
    buf: &mut [u8],
    deadline: Instant,
    on_timeout: &ClientError,
) -> ClientResult<usize> {
    loop {
        timeout_at(deadline, stream.readable())
            .await
            .map_err(|_| on_timeout.clone())??;
        match stream.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Push out a queued alert without waiting.
fn send_alert(conn: &mut ClientConnection, stream: &TcpStream) {
    let mut out = Vec::new();
    while conn.wants_write() {
        if conn.write_tls(&mut out).is_err() {
            break;
        }
    }
    let _ = stream.try_write(&out);
}
