//! DNS proxy request handler
//!
//! A semi-DNS-protocol-aware handler that relays requests between a client
//! and the sharded upstream client. The only protocol knowledge applied is
//! the transport reshape: DNS over stream transports carries a two-octet
//! big-endian length prefix that datagram transports omit, so UDP requests
//! gain the prefix on the way upstream and responses lose it on the way
//! back. Message contents are never inspected.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use dotgate_metrics::{ConnectionIoHook, ProxyHook, Stopwatch};
use dotgate_net::{BoxError, Client, Conn, PooledConn, ServerHandler, Transport};

use crate::error::{Error, Result};

/// The classic DNS message size ceiling. Stream transports may legally
/// carry larger messages, but the proxy preserves the legacy limit.
const MAX_DNS_PACKET_SIZE: usize = 1024;

/// The retry budget applied when the configured value is zero or negative.
///
/// A liberal default matters here: pooled connections live long enough that
/// the server side frequently closes one between transactions, and the
/// first sign of that is an I/O failure that a retry on a fresh connection
/// absorbs.
const DEFAULT_MAX_UPSTREAM_RETRIES: i64 = 16;

/// A sink for request-level failures, reported alongside metrics.
///
/// The default implementation discards reports; the CLI installs an
/// implementation backed by the configured error-reporting backend.
pub trait ErrorSink: Send + Sync {
    /// Reports one failed request.
    fn report(&self, _transport: Transport, _err: &(dyn std::error::Error + 'static)) {}
}

/// An [`ErrorSink`] that discards every report.
pub struct NoopErrorSink;

impl ErrorSink for NoopErrorSink {}

/// Configuration options for the proxy handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProxyHandlerOpts {
    /// The maximum number of times an upstream transaction is retried for
    /// one request. Zero or negative selects the default of 16.
    pub max_upstream_retries: i64,
}

/// The per-request proxy state machine.
pub struct ProxyHandler {
    upstream: Arc<dyn Client>,
    client_io_hook: Arc<dyn ConnectionIoHook>,
    upstream_io_hook: Arc<dyn ConnectionIoHook>,
    proxy_hook: Arc<dyn ProxyHook>,
    error_sink: Arc<dyn ErrorSink>,
    max_upstream_retries: u32,
}

impl ProxyHandler {
    /// Creates a handler proxying requests through the given upstream
    /// client.
    pub fn new(
        upstream: Arc<dyn Client>,
        client_io_hook: Arc<dyn ConnectionIoHook>,
        upstream_io_hook: Arc<dyn ConnectionIoHook>,
        proxy_hook: Arc<dyn ProxyHook>,
        error_sink: Arc<dyn ErrorSink>,
        opts: ProxyHandlerOpts,
    ) -> Self {
        let max_upstream_retries = if opts.max_upstream_retries <= 0 {
            DEFAULT_MAX_UPSTREAM_RETRIES as u32
        } else {
            opts.max_upstream_retries as u32
        };

        Self {
            upstream,
            client_io_hook,
            upstream_io_hook,
            proxy_hook,
            error_sink,
            max_upstream_retries,
        }
    }

    async fn proxy(&self, transport: Transport, conn: &mut dyn Conn) -> Result<()> {
        let mut rtt_timer = Stopwatch::start();

        let mut client_req = self.client_read(conn).await?;
        let client_addr = conn.peer_addr();

        tracing::debug!(
            "dns_proxy: read request from client: request_bytes={} transport={}",
            client_req.len(),
            transport,
        );

        if transport == Transport::Udp {
            // The UDP read blocks until a datagram arrives, during which no
            // client-observable latency accrues. Restart the RTT clock here
            // for an approximately correct end-to-end estimate.
            rtt_timer = Stopwatch::start();

            // DNS over stream transports prefixes each message with its
            // two-octet length; a datagram request gains the prefix to
            // conform before it is written upstream.
            let mut framed = Vec::with_capacity(2 + client_req.len());
            framed.extend_from_slice(&(client_req.len() as u16).to_be_bytes());
            framed.extend_from_slice(&client_req);
            client_req = framed;
        }

        let (mut upstream_resp, upstream_addr) = self.proxy_upstream(client_addr, &client_req).await?;

        // Strip the size header when the client requested over a datagram
        // transport.
        if transport == Transport::Udp {
            upstream_resp.drain(..2);
        }

        self.client_write(conn, &upstream_resp).await?;

        tracing::debug!(
            "dns_proxy: completed write back to client: rtt={:?} transport={}",
            rtt_timer.elapsed(),
            transport,
        );

        self.proxy_hook.emit_process(client_addr, upstream_addr);
        self.proxy_hook
            .emit_request_size(client_req.len(), client_addr);
        self.proxy_hook
            .emit_response_size(upstream_resp.len(), upstream_addr);
        self.proxy_hook.emit_rtt(
            rtt_timer.elapsed(),
            client_addr,
            upstream_addr,
            &transport.to_string(),
        );

        Ok(())
    }

    /// Reads a single request from the client.
    async fn client_read(&self, conn: &mut dyn Conn) -> Result<Vec<u8>> {
        let read_timer = Stopwatch::start();
        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];

        let n = match conn.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                self.client_io_hook.emit_read_error(conn.peer_addr());
                return Err(Error::Proxy(format!(
                    "error reading request from client: err={e}"
                )));
            }
        };

        self.client_io_hook
            .emit_read(read_timer.elapsed(), conn.peer_addr());

        buf.truncate(n);
        Ok(buf)
    }

    /// Acquires an upstream connection and performs a write/read
    /// transaction, retrying on pooled-connection breakage within the
    /// configured budget. Returns the length-prefixed upstream response and
    /// the upstream's address.
    async fn proxy_upstream(
        &self,
        client_addr: Option<SocketAddr>,
        client_req: &[u8],
    ) -> Result<(Vec<u8>, Option<SocketAddr>)> {
        let mut remaining = self.max_upstream_retries;

        loop {
            let mut upstream = self.upstream.conn().await.map_err(|e| {
                Error::Proxy(format!("error opening upstream connection: err={e}"))
            })?;

            let upstream_addr = upstream.peer_addr();

            match self.upstream_transact(client_addr, &mut upstream, client_req).await {
                Ok(resp) => {
                    // The transaction succeeded; the connection goes back
                    // into the long-lived pool.
                    upstream.release();

                    tracing::debug!(
                        "dns_proxy: completed upstream proxy: response_bytes={}",
                        resp.len(),
                    );

                    return Ok((resp, upstream_addr));
                }
                Err(e) => {
                    // No matter the retry budget, a connection that failed
                    // mid-I/O is destroyed.
                    upstream.destroy();

                    if remaining == 0 {
                        tracing::debug!(
                            "dns_proxy: upstream I/O failed; available retries exhausted"
                        );
                        return Err(e);
                    }

                    self.upstream_io_hook.emit_retry(upstream_addr);
                    tracing::debug!(
                        "dns_proxy: upstream I/O failed; retrying: remaining={remaining}"
                    );
                    remaining -= 1;
                }
            }
        }
    }

    /// Performs one write/read transaction with an upstream connection.
    async fn upstream_transact(
        &self,
        client_addr: Option<SocketAddr>,
        upstream: &mut PooledConn,
        client_req: &[u8],
    ) -> Result<Vec<u8>> {
        let tx_timer = Stopwatch::start();
        let upstream_addr = upstream.peer_addr();

        let write_timer = Stopwatch::start();
        match upstream.write(client_req).await {
            Ok(n) if n == client_req.len() => {}
            Ok(n) => {
                self.upstream_io_hook.emit_write_error(upstream_addr);
                return Err(Error::Proxy(format!(
                    "short write to upstream: expected={} actual={n}",
                    client_req.len(),
                )));
            }
            Err(e) => {
                self.upstream_io_hook.emit_write_error(upstream_addr);
                return Err(Error::Proxy(format!("error writing to upstream: err={e}")));
            }
        }
        self.upstream_io_hook
            .emit_write(write_timer.elapsed(), upstream_addr);

        tracing::debug!(
            "dns_proxy: wrote request to upstream: request_bytes={}",
            client_req.len(),
        );

        // The response follows DNS stream framing: two length octets, then
        // exactly that many payload octets. A short read on either part is
        // an I/O failure like any other.
        let read_timer = Stopwatch::start();
        let mut header = [0u8; 2];
        if let Err(e) = upstream.read_exact(&mut header).await {
            self.upstream_io_hook.emit_read_error(upstream_addr);
            return Err(Error::Proxy(format!(
                "error reading header from upstream: err={e}"
            )));
        }

        let resp_size = u16::from_be_bytes(header) as usize;
        let mut payload = vec![0u8; resp_size];
        if let Err(e) = upstream.read_exact(&mut payload).await {
            self.upstream_io_hook.emit_read_error(upstream_addr);
            return Err(Error::Proxy(format!(
                "error reading full response from upstream: err={e} expected_bytes={resp_size}"
            )));
        }

        self.upstream_io_hook
            .emit_read(read_timer.elapsed(), upstream_addr);
        self.proxy_hook
            .emit_upstream_latency(tx_timer.elapsed(), client_addr, upstream_addr);

        let mut resp = Vec::with_capacity(2 + resp_size);
        resp.extend_from_slice(&header);
        resp.extend_from_slice(&payload);
        Ok(resp)
    }

    /// Writes the response back to the client.
    async fn client_write(&self, conn: &mut dyn Conn, upstream_resp: &[u8]) -> Result<()> {
        let write_timer = Stopwatch::start();

        match conn.write(upstream_resp).await {
            Ok(n) if n == upstream_resp.len() => {}
            Ok(n) => {
                self.client_io_hook.emit_write_error(conn.peer_addr());
                return Err(Error::Proxy(format!(
                    "failed writing response bytes to client: expected={} actual={n}",
                    upstream_resp.len(),
                )));
            }
            Err(e) => {
                self.client_io_hook.emit_write_error(conn.peer_addr());
                return Err(Error::Proxy(format!(
                    "error writing response to client: err={e}"
                )));
            }
        }

        self.client_io_hook
            .emit_write(write_timer.elapsed(), conn.peer_addr());

        Ok(())
    }
}

#[async_trait]
impl ServerHandler for ProxyHandler {
    async fn handle(
        &self,
        transport: Transport,
        conn: &mut dyn Conn,
    ) -> std::result::Result<(), BoxError> {
        self.proxy(transport, conn).await.map_err(Into::into)
    }

    fn consume_error(&self, transport: Transport, err: BoxError) {
        tracing::error!("{transport}: {err}");
        self.proxy_hook.emit_error();
        self.error_sink.report(transport, err.as_ref());
    }
}
