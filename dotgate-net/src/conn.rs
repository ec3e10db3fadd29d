//! Transport adapters
//!
//! The proxy handler speaks one strict request/response byte-stream
//! interface, [`Conn`], regardless of the underlying transport:
//!
//! - [`TimedStream`] adapts any async byte stream (a plain TCP stream or a
//!   TLS session) by bounding each read and write with a deadline.
//! - [`UdpConn`] adapts a shared packet socket into single-exchange,
//!   stateful connection semantics: one read associates the peer, one write
//!   answers it.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;

/// A byte-stream connection with explicit, per-operation deadlines.
#[async_trait]
pub trait Conn: Send {
    /// Reads up to `buf.len()` bytes, returning the number of bytes read.
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes the entire buffer, returning the number of bytes written.
    async fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Reads exactly `buf.len()` bytes. A connection that closes
    /// mid-message surfaces as an error.
    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-message",
                ));
            }
            filled += n;
        }
        Ok(())
    }

    /// The remote peer's address, when known.
    fn peer_addr(&self) -> Option<SocketAddr>;
}

/// Bounds a future with a deadline. A zero limit means no deadline.
pub(crate) async fn maybe_timeout<T, F>(limit: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    if limit.is_zero() {
        return fut.await;
    }

    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "I/O deadline exceeded",
        )),
    }
}

/// An async byte stream with dynamic read and write deadlines applied to
/// each operation.
pub struct TimedStream<S> {
    stream: S,
    read_timeout: Duration,
    write_timeout: Duration,
    peer: Option<SocketAddr>,
}

impl<S> TimedStream<S> {
    /// Wraps a stream. Zero timeouts disable the respective deadline.
    pub fn new(
        stream: S,
        read_timeout: Duration,
        write_timeout: Duration,
        peer: Option<SocketAddr>,
    ) -> Self {
        Self {
            stream,
            read_timeout,
            write_timeout,
            peer,
        }
    }
}

#[async_trait]
impl<S> Conn for TimedStream<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        maybe_timeout(self.read_timeout, self.stream.read(buf)).await
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        maybe_timeout(self.write_timeout, self.stream.write_all(buf)).await?;
        Ok(buf.len())
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        maybe_timeout(self.read_timeout, async {
            self.stream.read_exact(buf).await.map(|_| ())
        })
        .await
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// A single-exchange view over a shared UDP socket.
///
/// The first read receives one datagram and associates the wrapper with its
/// sender; the write addresses that sender. Reusing the wrapper for a second
/// exchange is an error, matching the one-request-per-worker concurrency
/// model of the UDP listener.
pub struct UdpConn {
    socket: Arc<UdpSocket>,
    read_timeout: Duration,
    write_timeout: Duration,
    remote: Option<SocketAddr>,
}

impl UdpConn {
    /// Wraps a shared packet socket. Zero timeouts disable the respective
    /// deadline.
    pub fn new(socket: Arc<UdpSocket>, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            socket,
            read_timeout,
            write_timeout,
            remote: None,
        }
    }
}

#[async_trait]
impl Conn for UdpConn {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remote.is_some() {
            return Err(io::Error::other(
                "conn: already associated with a transaction",
            ));
        }

        let (n, remote) = maybe_timeout(self.read_timeout, self.socket.recv_from(buf)).await?;
        self.remote = Some(remote);

        Ok(n)
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remote = self.remote.ok_or_else(|| {
            io::Error::other("conn: no remote associated with this connection")
        })?;

        maybe_timeout(self.write_timeout, self.socket.send_to(buf, remote)).await
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.remote
    }
}
