//! Blocking engine: std sockets on tokio's blocking pool.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use parking_lot::Mutex;
use rustls::{ClientConnection, StreamOwned};
use socket2::SockAddr;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::{
    Engine, FrameAccumulator, connect_error, connect_stage, dns_error, map_io_error,
    no_addresses,
};
use crate::client::ClientConfig;
use crate::core::constants::READ_CHUNK_SIZE;
use crate::core::{ClientError, ClientResult};
use crate::events::{ErrorStage, EventDispatcher};
use crate::tls::TlsContext;
use crate::transport::{ConnectionState, Response, StateInfo, TrafficEvent};

enum Stream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Stream {
    fn tcp(&self) -> &TcpStream {
        match self {
            Stream::Plain(tcp) => tcp,
            Stream::Tls(tls) => &tls.sock,
        }
    }

    /// Best-effort TLS close_notify.
    fn close_notify(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(_) => Ok(()),
            Stream::Tls(tls) => {
                tls.conn.send_close_notify();
                tls.flush()
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(tcp) => tcp.read(buf),
            Stream::Tls(tls) => tls.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Plain(tcp) => tcp.write(buf),
            Stream::Tls(tls) => tls.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Plain(tcp) => tcp.flush(),
            Stream::Tls(tls) => tls.flush(),
        }
    }
}

struct Session {
    stream: Stream,
    remote: SocketAddr,
}

/// Forcibly shuts a socket down if the TLS handshake outlives its timeout.
///
/// Best effort: a handshake finishing just as the timer fires is still torn
/// down and reported as a timeout.
struct HandshakeGuard {
    timer: JoinHandle<()>,
    fired: Arc<AtomicBool>,
}

impl HandshakeGuard {
    fn arm(runtime: &Handle, probe: TcpStream, timeout: Duration) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let timer = runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            flag.store(true, Ordering::SeqCst);
            tracing::debug!(?timeout, "handshake timeout elapsed, shutting socket down");
            let _ = probe.shutdown(Shutdown::Both);
        });
        Self { timer, fired }
    }

    /// Cancel the timer; returns whether it already fired.
    fn disarm(self) -> bool {
        self.timer.abort();
        self.fired.load(Ordering::SeqCst)
    }
}

struct Inner {
    config: Arc<ClientConfig>,
    tls: Option<TlsContext>,
    events: Arc<EventDispatcher>,
    runtime: Handle,
    session: Mutex<Option<Session>>,
    /// Clone of the live socket, used to interrupt blocked reads on close.
    probe: Mutex<Option<TcpStream>>,
    /// TCP is up; the TLS handshake may still be running.
    connected: AtomicBool,
    ready: AtomicBool,
    closed: AtomicBool,
}

/// Engine using blocking std sockets.
///
/// Every operation runs on tokio's blocking pool; socket timeouts bound each
/// read and write.
pub struct BlockingEngine {
    inner: Arc<Inner>,
}

impl BlockingEngine {
    /// Create the engine. Must be called inside a tokio runtime.
    pub fn new(
        config: Arc<ClientConfig>,
        tls: Option<TlsContext>,
        events: Arc<EventDispatcher>,
    ) -> ClientResult<Self> {
        let runtime = Handle::try_current().map_err(|e| ClientError::NoRuntime(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                tls,
                events,
                runtime,
                session: Mutex::new(None),
                probe: Mutex::new(None),
                connected: AtomicBool::new(false),
                ready: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        })
    }

    async fn run_blocking<T, F>(&self, op: F) -> ClientResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> ClientResult<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| ClientError::from(io::Error::other(e)))?
    }
}

impl fmt::Debug for BlockingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingEngine")
            .field("label", &self.inner.config.label)
            .field("tls", &self.inner.tls.is_some())
            .field("ready", &self.inner.ready.load(Ordering::SeqCst))
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Engine for BlockingEngine {
    async fn connect(&self) -> ClientResult<()> {
        self.run_blocking(Inner::connect).await
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst) && !self.inner.closed.load(Ordering::SeqCst)
    }

    async fn send_and_receive(&self, payload: &[u8], timeout: Duration) -> ClientResult<Response> {
        let segments = self.inner.config.framer.frame_for_send(payload)?;
        self.run_blocking(move |inner| inner.exchange(&segments, timeout))
            .await
    }

    async fn close(&self) -> ClientResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.run_blocking(|inner| {
            inner.close();
            Ok(())
        })
        .await
    }
}

impl Inner {
    fn connect(&self) -> ClientResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::ClientClosed);
        }
        let mut session = self.session.lock();
        if session.is_some() && self.ready.load(Ordering::SeqCst) {
            return Ok(());
        }
        *session = None;
        self.connected.store(false, Ordering::SeqCst);

        match self.open() {
            Ok(opened) => {
                if self.closed.load(Ordering::SeqCst) {
                    self.connected.store(false, Ordering::SeqCst);
                    let _ = opened.stream.tcp().shutdown(Shutdown::Both);
                    return Err(ClientError::ClientClosed);
                }
                let remote = opened.remote;
                *session = Some(opened);
                self.ready.store(true, Ordering::SeqCst);
                tracing::info!(client = %self.config.label, %remote, "connected");
                self.events
                    .state_changed(ConnectionState::Ready, StateInfo::remote(remote));
                Ok(())
            }
            Err(error) => {
                *self.probe.lock() = None;
                self.connected.store(false, Ordering::SeqCst);
                self.events
                    .state_changed(ConnectionState::Error, StateInfo::default());
                self.events.error(connect_stage(&error), &error);
                Err(error)
            }
        }
    }

    fn open(&self) -> ClientResult<Session> {
        let config = &self.config;
        self.events
            .state_changed(ConnectionState::Resolving, StateInfo::default());
        let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| dns_error(&config.host, e))?
            .collect();
        let first = *addrs.first().ok_or_else(|| no_addresses(&config.host))?;

        self.events
            .state_changed(ConnectionState::Connecting, StateInfo::remote(first));
        let (tcp, remote) = self.connect_any(&addrs)?;
        tcp.set_read_timeout(Some(config.timeouts.read))?;
        tcp.set_write_timeout(Some(config.timeouts.write))?;
        config.socket.apply_nodelay(&tcp)?;
        *self.probe.lock() = Some(tcp.try_clone()?);
        self.connected.store(true, Ordering::SeqCst);
        self.events
            .state_changed(ConnectionState::Connected, StateInfo::remote(remote));

        let stream = match &self.tls {
            Some(tls) => {
                self.events
                    .state_changed(ConnectionState::Handshaking, StateInfo::remote(remote));
                self.handshake(tls, tcp)?
            }
            None => Stream::Plain(tcp),
        };
        Ok(Session { stream, remote })
    }

    fn connect_any(&self, addrs: &[SocketAddr]) -> ClientResult<(TcpStream, SocketAddr)> {
        let timeout = self.config.timeouts.connect;
        let mut last = None;
        for addr in addrs {
            tracing::debug!(client = %self.config.label, %addr, "connecting");
            let socket = self
                .config
                .socket
                .open(addr)
                .map_err(|e| connect_error(*addr, e))?;
            match socket.connect_timeout(&SockAddr::from(*addr), timeout) {
                Ok(()) => return Ok((socket.into(), *addr)),
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                    last = Some(ClientError::ConnectTimeout {
                        addr: *addr,
                        timeout,
                    });
                }
                Err(e) => last = Some(connect_error(*addr, e)),
            }
        }
        Err(last.unwrap_or_else(|| no_addresses(&self.config.host)))
    }

    fn handshake(&self, tls: &TlsContext, tcp: TcpStream) -> ClientResult<Stream> {
        let timeout = self.config.timeouts.handshake;
        let mut conn = tls.new_session()?;
        let guard = HandshakeGuard::arm(&self.runtime, tcp.try_clone()?, timeout);

        let mut sock = tcp;
        let mut result = Ok(());
        while conn.is_handshaking() {
            if let Err(e) = conn.complete_io(&mut sock) {
                result = Err(e);
                break;
            }
        }

        let fired = guard.disarm();
        match result {
            _ if fired => return Err(ClientError::HandshakeTimeout(timeout)),
            Err(e) => return Err(map_io_error(e)),
            Ok(()) => {}
        }

        tls.verify_session(&conn)?;
        tracing::debug!(
            client = %self.config.label,
            version = ?conn.protocol_version(),
            "TLS handshake complete"
        );
        Ok(Stream::Tls(Box::new(StreamOwned::new(conn, sock))))
    }

    fn exchange(&self, segments: &[Vec<u8>], timeout: Duration) -> ClientResult<Response> {
        let mut guard = self.session.lock();
        let session = guard.as_mut().ok_or(ClientError::NotReady)?;

        match self.exchange_on(session, segments, timeout) {
            Ok(response) => {
                self.events
                    .state_changed(ConnectionState::Ready, StateInfo::remote(session.remote));
                Ok(response)
            }
            Err(error) => {
                let remote = guard.take().map(|session| {
                    let _ = session.stream.tcp().shutdown(Shutdown::Both);
                    session.remote
                });
                *self.probe.lock() = None;
                self.ready.store(false, Ordering::SeqCst);
                self.connected.store(false, Ordering::SeqCst);
                let info = remote.map(StateInfo::remote).unwrap_or_default();
                self.events.state_changed(ConnectionState::Error, info);
                self.events.error(ErrorStage::Io, &error);
                Err(error)
            }
        }
    }

    fn exchange_on(
        &self,
        session: &mut Session,
        segments: &[Vec<u8>],
        timeout: Duration,
    ) -> ClientResult<Response> {
        let timeouts = &self.config.timeouts;
        let remote = session.remote;
        let started_at = SystemTime::now();
        let started = Instant::now();
        let deadline = started + timeout;
        let remaining = || deadline.saturating_duration_since(Instant::now());

        self.events
            .state_changed(ConnectionState::Sending, StateInfo::remote(remote));
        let mut sent = 0;
        for segment in segments {
            let budget = remaining();
            if budget.is_zero() {
                return Err(ClientError::RequestTimeout(timeout));
            }
            session
                .stream
                .tcp()
                .set_write_timeout(Some(timeouts.write.min(budget)))?;
            session.stream.write_all(segment).map_err(|e| match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ClientError::WriteTimeout,
                _ => map_io_error(e),
            })?;
            sent += segment.len();
        }
        session.stream.flush().map_err(map_io_error)?;
        self.events.traffic(TrafficEvent::sent(sent));

        self.events
            .state_changed(ConnectionState::Receiving, StateInfo::remote(remote));
        let mut frames = FrameAccumulator::new(
            self.config.framer.clone(),
            self.config.limits.max_frame_size,
        );
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        loop {
            let budget = remaining();
            if budget.is_zero() {
                return Err(ClientError::RequestTimeout(timeout));
            }
            session
                .stream
                .tcp()
                .set_read_timeout(Some(timeouts.read.min(budget)))?;
            match session.stream.read(&mut buf) {
                Ok(0) => return Err(ClientError::ConnectionClosed),
                Ok(n) => {
                    self.events.traffic(TrafficEvent::received(n));
                    if let Some(frame) = frames.push(&buf[..n])? {
                        return Ok(Response::new(
                            frame,
                            started.elapsed(),
                            Some(remote),
                            started_at,
                            SystemTime::now(),
                        ));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    return Err(if remaining().is_zero() {
                        ClientError::RequestTimeout(timeout)
                    } else {
                        ClientError::ReadTimeout
                    });
                }
                Err(e) => return Err(map_io_error(e)),
            }
        }
    }

    fn close(&self) {
        let mut session = match self.session.try_lock() {
            Some(session) => session,
            None => {
                // A blocked read or write holds the session; interrupt it.
                if let Some(probe) = self.probe.lock().as_ref() {
                    let _ = probe.shutdown(Shutdown::Both);
                }
                self.session.lock()
            }
        };
        if let Some(mut open) = session.take() {
            if let Err(e) = open.stream.close_notify() {
                tracing::debug!(client = %self.config.label, error = %e, "close_notify not delivered");
            }
            if let Err(e) = open.stream.tcp().shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    self.events.error(ErrorStage::Close, &ClientError::from(e));
                }
            }
        }
        *self.probe.lock() = None;
        self.ready.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        tracing::info!(client = %self.config.label, "closed");
        self.events
            .state_changed(ConnectionState::Closed, StateInfo::default());
    }
}
