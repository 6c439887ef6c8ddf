//! Upstream dialer interfaces
//!
//! The proxy re-originates every intercepted flow through a caller-supplied
//! dialer: one for TCP byte-streams, one for UDP datagram connections. Both
//! are object-safe traits with blanket implementations for async closures,
//! so tests and embedders can pass plain lambdas. The default
//! implementations connect directly to the intercepted destination.
//!
//! Dial failures are per-flow: the engine drops the flow, counts the
//! failure, and keeps serving. Deadlines, retries, and address rewriting
//! are the dialer's own business.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// Anything that can stand in for one side of a TCP relay
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed byte-stream produced by a [`TcpDialer`]
pub type BoxTcpStream = Box<dyn AsyncStream>;

/// Boxed datagram connection produced by a [`UdpDialer`]
pub type BoxDatagram = Box<dyn OutboundDatagram>;

/// Produces an upstream TCP byte-stream for an intercepted destination
#[async_trait]
pub trait TcpDialer: Send + Sync {
    /// Dial the destination and return a connected byte-stream.
    async fn dial(&self, dst: SocketAddr) -> io::Result<BoxTcpStream>;
}

/// Produces an upstream datagram connection for an intercepted destination
#[async_trait]
pub trait UdpDialer: Send + Sync {
    /// Dial the destination and return a connected datagram socket.
    async fn dial(&self, dst: SocketAddr) -> io::Result<BoxDatagram>;
}

/// A connected datagram socket as seen by the relay
#[async_trait]
pub trait OutboundDatagram: Send + Sync {
    /// Send one datagram to the connected peer.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Receive one datagram from the connected peer.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

#[async_trait]
impl OutboundDatagram for UdpSocket {
    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }
}

#[async_trait]
impl<F, Fut> TcpDialer for F
where
    F: Fn(SocketAddr) -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<BoxTcpStream>> + Send,
{
    async fn dial(&self, dst: SocketAddr) -> io::Result<BoxTcpStream> {
        (self)(dst).await
    }
}

#[async_trait]
impl<F, Fut> UdpDialer for F
where
    F: Fn(SocketAddr) -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<BoxDatagram>> + Send,
{
    async fn dial(&self, dst: SocketAddr) -> io::Result<BoxDatagram> {
        (self)(dst).await
    }
}

/// Default TCP dialer: connects directly to the intercepted destination
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectTcpDialer;

#[async_trait]
impl TcpDialer for DirectTcpDialer {
    async fn dial(&self, dst: SocketAddr) -> io::Result<BoxTcpStream> {
        let stream = TcpStream::connect(dst).await?;
        // Delayed ACKs interact badly with Nagle on relayed streams
        if let Err(e) = stream.set_nodelay(true) {
            debug!("failed to set TCP_NODELAY for {}: {}", dst, e);
        }
        Ok(Box::new(stream))
    }
}

/// Default UDP dialer: binds an ephemeral socket and connects it
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectUdpDialer;

#[async_trait]
impl UdpDialer for DirectUdpDialer {
    async fn dial(&self, dst: SocketAddr) -> io::Result<BoxDatagram> {
        let bind_addr = if dst.is_ipv4() {
            SocketAddr::from((std::net::Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((std::net::Ipv6Addr::UNSPECIFIED, 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(dst).await?;
        Ok(Box::new(socket))
    }
}
