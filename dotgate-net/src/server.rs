//! Listener drivers
//!
//! The servers own the listening sockets and the concurrency model; request
//! semantics live entirely behind the [`ServerHandler`] trait. The TCP
//! server spawns one task per accepted connection. The UDP server runs a
//! fixed pool of worker tasks over one shared packet socket, each worker
//! serving one single-exchange [`UdpConn`] at a time; concurrent kernel
//! reads on the shared socket queue naturally.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dotgate_metrics::ConnectionLifecycleHook;
use tokio::net::{TcpListener, UdpSocket};

use crate::conn::{Conn, TimedStream, UdpConn};
use crate::error::Result;

/// The default number of UDP worker tasks.
const DEFAULT_UDP_WORKERS: usize = 16;

/// Errors surfaced by a server handler.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A network transport type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Stream transport; messages carry a two-octet length prefix.
    Tcp,
    /// Datagram transport; one unframed message per datagram.
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Logic for serving a single client connection on any transport.
#[async_trait]
pub trait ServerHandler: Send + Sync {
    /// Runs when the server establishes a connection with a client.
    async fn handle(
        &self,
        transport: Transport,
        conn: &mut dyn Conn,
    ) -> std::result::Result<(), BoxError>;

    /// Invoked when the server fails to establish a client connection, or
    /// when [`handle`](Self::handle) returns an error.
    fn consume_error(&self, transport: Transport, err: BoxError);
}

/// TCP server configuration options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpServerOpts {
    /// Per-read deadline for client connections. Zero disables it.
    pub read_timeout: Duration,
    /// Per-write deadline for client connections. Zero disables it.
    pub write_timeout: Duration,
}

/// A server listening on a TCP address.
pub struct TcpServer {
    listener: TcpListener,
    hook: Arc<dyn ConnectionLifecycleHook>,
    opts: TcpServerOpts,
}

impl TcpServer {
    /// Binds a TCP listener on the specified address.
    pub async fn bind(
        addr: &str,
        hook: Arc<dyn ConnectionLifecycleHook>,
        opts: TcpServerOpts,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            hook,
            opts,
        })
    }

    /// The address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts and serves connections indefinitely with the given handler.
    pub async fn serve<H: ServerHandler + 'static>(self, handler: Arc<H>) -> Result<()> {
        tracing::info!("tcp server listening on {:?}", self.listener.local_addr());

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    self.hook.emit_error();
                    handler.consume_error(Transport::Tcp, e.into());
                    continue;
                }
            };

            // Accept latency is not measured; opens on the accept side
            // report zero.
            self.hook.emit_open(Duration::ZERO, Some(peer));

            let handler = Arc::clone(&handler);
            let hook = Arc::clone(&self.hook);
            let opts = self.opts;

            tokio::spawn(async move {
                let mut conn =
                    TimedStream::new(stream, opts.read_timeout, opts.write_timeout, Some(peer));

                if let Err(e) = handler.handle(Transport::Tcp, &mut conn).await {
                    handler.consume_error(Transport::Tcp, e);
                }

                hook.emit_close(Some(peer));
            });
        }
    }
}

/// UDP server configuration options.
#[derive(Debug, Clone, Copy, Default)]
pub struct UdpServerOpts {
    /// The number of worker tasks serving datagrams concurrently. Zero
    /// selects the default of 16.
    pub max_concurrent_connections: usize,
    /// Deadline for receiving a datagram. Since UDP is connectionless, this
    /// spans from when a worker starts listening to when a client sends.
    /// Zero disables it.
    pub read_timeout: Duration,
    /// Deadline for writing a response datagram. Zero disables it.
    pub write_timeout: Duration,
}

/// A server listening on a UDP address.
pub struct UdpServer {
    socket: Arc<UdpSocket>,
    workers: usize,
    opts: UdpServerOpts,
}

impl UdpServer {
    /// Binds a UDP socket on the specified address.
    pub async fn bind(addr: &str, opts: UdpServerOpts) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        let workers = if opts.max_concurrent_connections == 0 {
            DEFAULT_UDP_WORKERS
        } else {
            opts.max_concurrent_connections
        };

        Ok(Self {
            socket: Arc::new(socket),
            workers,
            opts,
        })
    }

    /// The address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serves datagrams indefinitely with the given handler.
    pub async fn serve<H: ServerHandler + 'static>(self, handler: Arc<H>) -> Result<()> {
        tracing::info!(
            "udp server listening on {:?} with {} workers",
            self.socket.local_addr(),
            self.workers
        );

        let mut tasks = Vec::with_capacity(self.workers);

        for _ in 0..self.workers {
            let socket = Arc::clone(&self.socket);
            let handler = Arc::clone(&handler);
            let opts = self.opts;

            tasks.push(tokio::spawn(async move {
                loop {
                    let mut conn =
                        UdpConn::new(Arc::clone(&socket), opts.read_timeout, opts.write_timeout);

                    if let Err(e) = handler.handle(Transport::Udp, &mut conn).await {
                        handler.consume_error(Transport::Udp, e);
                    }
                }
            }));
        }

        for task in tasks {
            let _ = task.await;
        }

        Ok(())
    }
}
