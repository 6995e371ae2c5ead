//! Connected transports and their liveness checks.

use super::tls::{TlsInfo, ALPN_H2};
use crate::base::neterror::NetError;
use crate::base::tracker::TrackedOp;
use futures::task::noop_waker_ref;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Per-connection socket options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketOptions {
    pub nodelay: bool,
    /// `SO_LINGER`; `None` leaves the system default.
    pub linger: Option<Duration>,
    /// Bound on every individual read. `None` waits forever.
    pub read_timeout: Option<Duration>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self { nodelay: true, linger: None, read_timeout: None }
    }
}

impl SocketOptions {
    pub(crate) fn apply(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nodelay(self.nodelay)?;
        if self.linger.is_some() {
            stream.set_linger(self.linger)?;
        }
        Ok(())
    }
}

/// Represents a connected socket (TCP or TLS).
/// Mimics net::StreamSocket.
pub trait StreamSocket: AsyncRead + AsyncWrite + Unpin + Send + Sync + fmt::Debug {
    /// The peer has not closed the connection.
    fn is_connected(&self) -> bool;

    /// Connected, and nothing unread is waiting on the socket.
    /// Matches Chromium's IsConnectedAndIdle().
    fn is_connected_and_idle(&self) -> bool;
}

#[derive(Debug)]
pub enum SocketType {
    Tcp(TcpStream),
    Ssl(tokio_boring::SslStream<TcpStream>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Idle,
    Readable,
    Closed,
}

impl SocketType {
    /// Non-blocking peek at the TCP socket. Never consumes data.
    fn liveness(stream: &TcpStream) -> Liveness {
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        let mut cx = Context::from_waker(noop_waker_ref());
        match stream.poll_peek(&mut cx, &mut buf) {
            Poll::Pending => Liveness::Idle,
            Poll::Ready(Ok(0)) | Poll::Ready(Err(_)) => Liveness::Closed,
            Poll::Ready(Ok(_)) => Liveness::Readable,
        }
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            SocketType::Tcp(s) => s,
            SocketType::Ssl(s) => s.get_ref(),
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, SocketType::Ssl(_))
    }

    /// Protocol selected by ALPN, if any.
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        match self {
            SocketType::Tcp(_) => None,
            SocketType::Ssl(s) => s.ssl().selected_alpn_protocol(),
        }
    }

    pub fn negotiated_h2(&self) -> bool {
        self.alpn_protocol() == Some(ALPN_H2)
    }

    pub fn tls_info(&self) -> Option<TlsInfo> {
        match self {
            SocketType::Tcp(_) => None,
            SocketType::Ssl(s) => {
                let ssl = s.ssl();
                Some(TlsInfo {
                    protocol: ssl.version_str().to_string(),
                    cipher: ssl.current_cipher().map(|c| c.name().to_string()).unwrap_or_default(),
                })
            }
        }
    }
}

impl AsyncRead for SocketType {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            SocketType::Ssl(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SocketType {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            SocketType::Ssl(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_flush(cx),
            SocketType::Ssl(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            SocketType::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            SocketType::Ssl(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

impl StreamSocket for SocketType {
    fn is_connected(&self) -> bool {
        Self::liveness(self.tcp()) != Liveness::Closed
    }

    fn is_connected_and_idle(&self) -> bool {
        Self::liveness(self.tcp()) == Liveness::Idle
    }
}

/// A socket owned by the pool, with usage state for reuse decisions.
/// Follows Chromium's IdleSocket::IsUsable() pattern.
pub struct WrappedSocket {
    inner: SocketType,
    was_used: bool,
    connection: Option<TrackedOp>,
}

impl fmt::Debug for WrappedSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedSocket")
            .field("inner", &self.inner)
            .field("was_used", &self.was_used)
            .finish()
    }
}

impl WrappedSocket {
    pub fn new(socket: SocketType, connection: Option<TrackedOp>) -> Self {
        Self { inner: socket, was_used: false, connection }
    }

    pub fn mark_used(&mut self) {
        self.was_used = true;
    }

    pub fn was_ever_used(&self) -> bool {
        self.was_used
    }

    /// Previously used sockets must be connected and idle; fresh ones only
    /// connected.
    pub fn is_usable(&self) -> Result<(), NetError> {
        if self.was_used {
            if !self.inner.is_connected_and_idle() {
                return if !self.inner.is_connected() {
                    Err(NetError::SocketRemoteClosed)
                } else {
                    Err(NetError::DataReceivedUnexpectedly)
                };
            }
        } else if !self.inner.is_connected() {
            return Err(NetError::SocketRemoteClosed);
        }
        Ok(())
    }

    pub fn inner(&self) -> &SocketType {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut SocketType {
        &mut self.inner
    }

    /// Hand the transport to a new owner; its connection count goes along.
    pub fn into_parts(self) -> (SocketType, Option<TrackedOp>) {
        (self.inner, self.connection)
    }
}
