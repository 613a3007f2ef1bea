//! Non-blocking engine: tokio readiness with manual TLS record handling.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use rustls::ClientConnection;
use socket2::SockRef;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout_at};

use super::handshake::{HandshakeDriver, enlarge, flush_records, read_some, write_all};
use super::{
    Engine, FrameAccumulator, connect_error, connect_stage, dns_error, no_addresses,
};
use crate::client::ClientConfig;
use crate::core::constants::{READ_CHUNK_SIZE, TLS_APP_BUFFER_LIMIT};
use crate::core::{ClientError, ClientResult};
use crate::events::{ErrorStage, EventDispatcher};
use crate::tls::{TlsContext, map_rustls_error};
use crate::transport::{ConnectionState, Response, StateInfo, TrafficEvent};

struct TlsSession {
    conn: ClientConnection,
    /// Records read from the socket but not yet handed to rustls.
    inbound: Vec<u8>,
    /// Decrypted application data scratch buffer.
    app: Vec<u8>,
}

struct Session {
    stream: TcpStream,
    tls: Option<TlsSession>,
    remote: SocketAddr,
}

/// Per-request deadlines.
struct Deadlines {
    request: Instant,
    timeout: Duration,
    read: Duration,
    write: Duration,
}

impl Deadlines {
    /// Deadline for one read wait and the error reported when it passes.
    fn read(&self) -> (Instant, ClientError) {
        self.bounded(self.read, ClientError::ReadTimeout)
    }

    fn write(&self) -> (Instant, ClientError) {
        self.bounded(self.write, ClientError::WriteTimeout)
    }

    fn bounded(&self, op: Duration, op_error: ClientError) -> (Instant, ClientError) {
        let op_deadline = Instant::now() + op;
        if op_deadline < self.request {
            (op_deadline, op_error)
        } else {
            (self.request, ClientError::RequestTimeout(self.timeout))
        }
    }
}

/// Engine driven by tokio socket readiness.
///
/// Connect, handshake, writes and reads are explicit readiness waits bounded
/// by deadlines; TLS records are moved between the socket and a sans-I/O
/// rustls session by hand.
pub struct NonBlockingEngine {
    config: Arc<ClientConfig>,
    tls: Option<TlsContext>,
    events: Arc<EventDispatcher>,
    session: Mutex<Option<Session>>,
    /// TCP is up; the TLS handshake may still be running.
    connected: AtomicBool,
    ready: AtomicBool,
    closed: AtomicBool,
}

impl NonBlockingEngine {
    /// Create the engine.
    pub fn new(
        config: Arc<ClientConfig>,
        tls: Option<TlsContext>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            config,
            tls,
            events,
            session: Mutex::new(None),
            connected: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    async fn open(&self) -> ClientResult<Session> {
        let config = &self.config;
        self.events
            .state_changed(ConnectionState::Resolving, StateInfo::default());
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((config.host.as_str(), config.port))
            .await
            .map_err(|e| dns_error(&config.host, e))?
            .collect();
        let first = *addrs.first().ok_or_else(|| no_addresses(&config.host))?;

        self.events
            .state_changed(ConnectionState::Connecting, StateInfo::remote(first));
        let (stream, remote) = self.connect_any(&addrs).await?;
        stream.set_nodelay(config.socket.tcp_nodelay)?;
        self.connected.store(true, Ordering::SeqCst);
        self.events
            .state_changed(ConnectionState::Connected, StateInfo::remote(remote));

        let tls = match &self.tls {
            Some(context) => {
                self.events
                    .state_changed(ConnectionState::Handshaking, StateInfo::remote(remote));
                Some(self.handshake(context, &stream).await?)
            }
            None => None,
        };
        Ok(Session {
            stream,
            tls,
            remote,
        })
    }

    async fn connect_any(&self, addrs: &[SocketAddr]) -> ClientResult<(TcpStream, SocketAddr)> {
        let timeout = self.config.timeouts.connect;
        let deadline = Instant::now() + timeout;
        let mut last = None;
        for addr in addrs {
            tracing::debug!(client = %self.config.label, %addr, "connecting");
            let socket = self
                .config
                .socket
                .open(addr)
                .map_err(|e| connect_error(*addr, e))?;
            socket
                .set_nonblocking(true)
                .map_err(|e| connect_error(*addr, e))?;
            let socket = TcpSocket::from_std_stream(socket.into());
            match timeout_at(deadline, socket.connect(*addr)).await {
                Ok(Ok(stream)) => return Ok((stream, *addr)),
                Ok(Err(e)) => last = Some(connect_error(*addr, e)),
                Err(_) => {
                    return Err(ClientError::ConnectTimeout {
                        addr: *addr,
                        timeout,
                    });
                }
            }
        }
        Err(last.unwrap_or_else(|| no_addresses(&self.config.host)))
    }

    async fn handshake(&self, context: &TlsContext, stream: &TcpStream) -> ClientResult<TlsSession> {
        let timeout = self.config.timeouts.handshake;
        let mut conn = context.new_session()?;
        let deadline = Instant::now() + timeout;
        let inbound = HandshakeDriver::new(
            &mut conn,
            stream,
            deadline,
            ClientError::HandshakeTimeout(timeout),
        )
        .run()
        .await?;
        context.verify_session(&conn)?;
        tracing::debug!(
            client = %self.config.label,
            version = ?conn.protocol_version(),
            "TLS handshake complete"
        );
        Ok(TlsSession {
            conn,
            inbound,
            app: vec![0u8; READ_CHUNK_SIZE],
        })
    }

    async fn exchange(
        &self,
        session: &mut Session,
        segments: &[Vec<u8>],
        timeout: Duration,
    ) -> ClientResult<Response> {
        let timeouts = &self.config.timeouts;
        let started_at = SystemTime::now();
        let started = Instant::now();
        let deadlines = Deadlines {
            request: started + timeout,
            timeout,
            read: timeouts.read,
            write: timeouts.write,
        };

        self.events
            .state_changed(ConnectionState::Sending, StateInfo::remote(session.remote));
        let mut sent = 0;
        for segment in segments {
            match session.tls.as_mut() {
                Some(tls) => send_tls(&mut tls.conn, &session.stream, segment, &deadlines).await?,
                None => {
                    let (deadline, on_timeout) = deadlines.write();
                    write_all(&session.stream, segment, deadline, &on_timeout).await?;
                }
            }
            sent += segment.len();
        }
        self.events.traffic(TrafficEvent::sent(sent));

        self.events
            .state_changed(ConnectionState::Receiving, StateInfo::remote(session.remote));
        let mut frames = FrameAccumulator::new(
            self.config.framer.clone(),
            self.config.limits.max_frame_size,
        );
        let mut net = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let chunk = match session.tls.as_mut() {
                Some(tls) => {
                    recv_tls(tls, &session.stream, &mut net, &deadlines).await?
                }
                None => {
                    let (deadline, on_timeout) = deadlines.read();
                    let n = read_some(&session.stream, &mut net, deadline, &on_timeout).await?;
                    if n == 0 {
                        return Err(ClientError::ConnectionClosed);
                    }
                    net[..n].to_vec()
                }
            };
            self.events.traffic(TrafficEvent::received(chunk.len()));
            if let Some(frame) = frames.push(&chunk)? {
                return Ok(Response::new(
                    frame,
                    started.elapsed(),
                    Some(session.remote),
                    started_at,
                    SystemTime::now(),
                ));
            }
        }
    }

    async fn shutdown(&self, session: Session, close_notify: bool) {
        let Session {
            stream, mut tls, ..
        } = session;
        if close_notify {
            if let Some(tls) = tls.as_mut() {
                tls.conn.send_close_notify();
                let deadline = Instant::now() + self.config.timeouts.write;
                if let Err(e) =
                    flush_records(&mut tls.conn, &stream, deadline, &ClientError::WriteTimeout).await
                {
                    tracing::debug!(client = %self.config.label, error = %e, "close_notify not delivered");
                }
            }
        }
        if let Err(e) = SockRef::from(&stream).shutdown(Shutdown::Both) {
            if e.kind() != io::ErrorKind::NotConnected {
                self.events.error(ErrorStage::Close, &ClientError::from(e));
            }
        }
    }
}

/// Encrypt `plaintext` and write the records, interleaving so the session's
/// outgoing buffer never overflows.
async fn send_tls(
    conn: &mut ClientConnection,
    stream: &TcpStream,
    mut plaintext: &[u8],
    deadlines: &Deadlines,
) -> ClientResult<()> {
    while !plaintext.is_empty() {
        let n = conn.writer().write(plaintext)?;
        plaintext = &plaintext[n..];
        let (deadline, on_timeout) = deadlines.write();
        flush_records(conn, stream, deadline, &on_timeout).await?;
    }
    Ok(())
}

/// Read records until some application data is available and return it.
async fn recv_tls(
    tls: &mut TlsSession,
    stream: &TcpStream,
    net: &mut [u8],
    deadlines: &Deadlines,
) -> ClientResult<Vec<u8>> {
    let mut plaintext = Vec::new();
    loop {
        // Feed records left over from the handshake or a previous read,
        // draining after each batch so rustls' plaintext buffer never fills.
        let mut peer_closed = false;
        while !tls.inbound.is_empty() {
            let mut pending = &tls.inbound[..];
            let used = tls.conn.read_tls(&mut pending)?;
            tls.inbound.drain(..used);
            tls.conn
                .process_new_packets()
                .map_err(|e| ClientError::Tls(map_rustls_error(&e)))?;
            peer_closed |= drain_plaintext(tls, &mut plaintext)?;
        }
        peer_closed |= drain_plaintext(tls, &mut plaintext)?;

        if !plaintext.is_empty() {
            return Ok(plaintext);
        }
        if peer_closed {
            return Err(ClientError::ConnectionClosed);
        }

        // rustls may owe the peer records (e.g. key updates).
        let (deadline, on_timeout) = deadlines.write();
        flush_records(&mut tls.conn, stream, deadline, &on_timeout).await?;

        let (deadline, on_timeout) = deadlines.read();
        let n = read_some(stream, net, deadline, &on_timeout).await?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        tls.inbound.extend_from_slice(&net[..n]);
    }
}

/// Move every decrypted byte out of the session into `out`. Returns true
/// once the peer's close_notify has been seen.
fn drain_plaintext(tls: &mut TlsSession, out: &mut Vec<u8>) -> ClientResult<bool> {
    loop {
        match tls.conn.reader().read(&mut tls.app) {
            Ok(0) => return Ok(true),
            Ok(n) => {
                out.extend_from_slice(&tls.app[..n]);
                if n == tls.app.len() && !enlarge(&mut tls.app, TLS_APP_BUFFER_LIMIT) {
                    tracing::trace!(size = tls.app.len(), "application buffer at limit");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(super::map_io_error(e)),
        }
    }
}

impl fmt::Debug for NonBlockingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonBlockingEngine")
            .field("label", &self.config.label)
            .field("tls", &self.tls.is_some())
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Engine for NonBlockingEngine {
    async fn connect(&self) -> ClientResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ClientClosed);
        }
        let mut session = self.session.lock().await;
        if session.is_some() && self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(stale) = session.take() {
            self.shutdown(stale, false).await;
        }
        self.connected.store(false, Ordering::SeqCst);

        match self.open().await {
            Ok(opened) => {
                let remote = opened.remote;
                *session = Some(opened);
                self.ready.store(true, Ordering::SeqCst);
                tracing::info!(client = %self.config.label, %remote, "connected");
                self.events
                    .state_changed(ConnectionState::Ready, StateInfo::remote(remote));
                Ok(())
            }
            Err(error) => {
                self.connected.store(false, Ordering::SeqCst);
                self.events
                    .state_changed(ConnectionState::Error, StateInfo::default());
                self.events.error(connect_stage(&error), &error);
                Err(error)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn send_and_receive(&self, payload: &[u8], timeout: Duration) -> ClientResult<Response> {
        let segments = self.config.framer.frame_for_send(payload)?;
        let mut guard = self.session.lock().await;
        let session = guard.as_mut().ok_or(ClientError::NotReady)?;

        match self.exchange(session, &segments, timeout).await {
            Ok(response) => {
                self.events
                    .state_changed(ConnectionState::Ready, StateInfo::remote(session.remote));
                Ok(response)
            }
            Err(error) => {
                self.ready.store(false, Ordering::SeqCst);
                self.connected.store(false, Ordering::SeqCst);
                let remote = session.remote;
                if let Some(broken) = guard.take() {
                    self.shutdown(broken, false).await;
                }
                self.events
                    .state_changed(ConnectionState::Error, StateInfo::remote(remote));
                self.events.error(ErrorStage::Io, &error);
                Err(error)
            }
        }
    }

    async fn close(&self) -> ClientResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.ready.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if let Some(open) = self.session.lock().await.take() {
            self.shutdown(open, true).await;
        }
        tracing::info!(client = %self.config.label, "closed");
        self.events
            .state_changed(ConnectionState::Closed, StateInfo::default());
        Ok(())
    }
}
