//! Forwarded connection handle with broker-reported addressing

use offload_proto::ConnectionInfo;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Logical endpoint of a forwarded connection.
///
/// The host is kept as reported by the broker and may be a name rather than
/// an IP literal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Byte stream that reports the endpoints handed out by its listener
pub trait AddressedStream: AsyncRead + AsyncWrite + Unpin + Send {
    fn local_endpoint(&self) -> &Endpoint;
    fn peer_endpoint(&self) -> &Endpoint;
}

/// One connection pulled from the broker (or a local listener).
///
/// All I/O goes straight to the wrapped stream; only address reporting is
/// overridden.
pub struct OffloadSocket<S> {
    inner: S,
    local: Endpoint,
    peer: Endpoint,
}

impl<S> OffloadSocket<S> {
    pub fn new(inner: S, local: Endpoint, peer: Endpoint) -> Self {
        Self { inner, local, peer }
    }

    pub fn from_info(inner: S, info: &ConnectionInfo) -> Self {
        Self::new(
            inner,
            Endpoint::new(info.lhost.clone(), info.lport),
            Endpoint::new(info.rhost.clone(), info.rport),
        )
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub fn peer_endpoint(&self) -> &Endpoint {
        &self.peer
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> fmt::Debug for OffloadSocket<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffloadSocket")
            .field("local", &self.local)
            .field("peer", &self.peer)
            .finish()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for OffloadSocket<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for OffloadSocket<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

impl<S> AddressedStream for OffloadSocket<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    fn peer_endpoint(&self) -> &Endpoint {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_reports_broker_addresses() {
        let (inner, _peer) = tokio::io::duplex(64);
        let info = ConnectionInfo::new("10.0.0.1", 4444, "8.8.8.8", 53);
        let socket = OffloadSocket::from_info(inner, &info);

        assert_eq!(socket.local_endpoint(), &Endpoint::new("10.0.0.1", 4444));
        assert_eq!(socket.peer_endpoint(), &Endpoint::new("8.8.8.8", 53));
        assert_eq!(socket.peer_endpoint().to_string(), "8.8.8.8:53");
    }

    #[tokio::test]
    async fn test_io_is_delegated() {
        let (inner, mut peer) = tokio::io::duplex(64);
        let mut socket = OffloadSocket::new(
            inner,
            Endpoint::new("a", 1),
            Endpoint::new("b", 2),
        );

        socket.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        peer.write_all(b"pong").await.unwrap();
        socket.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        socket.shutdown().await.unwrap();
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("::1", 53).to_string(), "[::1]:53");
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        assert_eq!(Endpoint::from(addr), Endpoint::new("127.0.0.1", 8080));
    }
}
