//! TCP socket tuning.
//!
//! Both engines create their socket through [`SocketOptions::open`], so the
//! same kernel options apply whether the stream is later driven by blocking
//! reads or by tokio readiness.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use socket2::{Domain, Protocol, SockRef, Socket, Type};

/// Kernel-level options applied to every client socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    /// `TCP_NODELAY`.
    pub tcp_nodelay: bool,
    /// `SO_KEEPALIVE`.
    pub keepalive: bool,
    /// `SO_LINGER`; `None` keeps the kernel default.
    pub linger: Option<Duration>,
    /// `SO_RCVBUF`; `None` keeps the kernel default.
    pub recv_buffer_size: Option<usize>,
    /// `SO_SNDBUF`; `None` keeps the kernel default.
    pub send_buffer_size: Option<usize>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketOptions {
    /// Options with `TCP_NODELAY` and `SO_KEEPALIVE` on, everything else default.
    pub const fn new() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive: true,
            linger: None,
            recv_buffer_size: None,
            send_buffer_size: None,
        }
    }

    /// Set `TCP_NODELAY`.
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set `SO_KEEPALIVE`.
    pub fn keepalive(mut self, enabled: bool) -> Self {
        self.keepalive = enabled;
        self
    }

    /// Set `SO_LINGER`.
    pub fn linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// Set `SO_RCVBUF`.
    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Set `SO_SNDBUF`.
    pub fn send_buffer_size(mut self, size: usize) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Create an unconnected TCP socket for `addr` with these options.
    pub fn open(&self, addr: &SocketAddr) -> io::Result<Socket> {
        let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
        self.apply_to(&SockRef::from(&socket))?;
        Ok(socket)
    }

    /// Apply the pre-connect options through a borrowed socket handle.
    pub fn apply_to(&self, sock: &SockRef<'_>) -> io::Result<()> {
        sock.set_keepalive(self.keepalive)?;
        sock.set_linger(self.linger)?;
        if let Some(size) = self.recv_buffer_size {
            sock.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            sock.set_send_buffer_size(size)?;
        }
        Ok(())
    }

    /// Apply `TCP_NODELAY` to a connected std stream.
    pub fn apply_nodelay(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.tcp_nodelay)
    }
}
