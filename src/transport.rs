//! # Raw Transport
//!
//! The signed layer runs on top of any reliable, ordered byte stream. This
//! module names that boundary and provides the TCP implementation used by
//! committee assembly and the aggregator.
//!
//! - [`RawStream`]: any `AsyncRead + AsyncWrite` stream that can move across
//!   tasks (TCP sockets, in-memory duplex pipes in tests)
//! - [`dial`]: TCP connect with a timeout
//! - [`Listener`]: TCP accept loop wrapper
//!
//! Nothing here authenticates; see [`crate::handshake`] for that.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::trace;

/// Default timeout for establishing an outbound TCP connection.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Byte stream the signed layer can own.
pub trait RawStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> RawStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased raw stream, so connections over TCP and over in-memory pipes
/// share one type.
pub type BoxedStream = Box<dyn RawStream>;

/// Open a TCP connection to `addr`, failing with `TimedOut` after `timeout`.
pub async fn dial(addr: impl ToSocketAddrs, timeout: Duration) -> io::Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
    stream.set_nodelay(true)?;
    trace!(peer = ?stream.peer_addr().ok(), "raw connection established");
    Ok(stream)
}

/// Listening socket that yields unauthenticated raw streams.
///
/// Dropping the listener closes the socket and stops further accepts.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let inner = TcpListener::bind(addr).await?;
        Ok(Self { inner })
    }

    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let (stream, addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok((stream, addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_reaches_listener() {
        let listener = Listener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let accept = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.expect("read");
            buf
        });

        let mut client = dial(addr, DEFAULT_DIAL_TIMEOUT).await.expect("dial");
        client.write_all(b"ping").await.expect("write");

        assert_eq!(&accept.await.expect("join"), b"ping");
    }

    #[tokio::test]
    async fn dial_to_closed_port_fails() {
        let listener = Listener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        drop(listener);

        assert!(dial(addr, Duration::from_secs(2)).await.is_err());
    }
}
