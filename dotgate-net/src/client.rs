//! TLS upstream client
//!
//! A [`TlsClient`] owns one persistent connection pool for a single
//! DNS-over-TLS upstream. Its dialer opens a TCP connection (with TCP Fast
//! Open where the platform offers it), performs a TLS handshake that
//! verifies the configured server name, and wraps the session with
//! per-operation read/write deadlines. A bounded TLS session cache, shared
//! across all dials to the upstream, keeps resumed handshakes cheap.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use dotgate_metrics::ConnectionLifecycleHook;
use rustls::client::{ClientSessionMemoryCache, Resumption};
use rustls_pki_types::ServerName;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::conn::{maybe_timeout, Conn, TimedStream};
use crate::error::{Error, Result};
use crate::pool::{Dialer, PersistentConnPool, PersistentConnPoolOpts, PooledConn};

/// A network client that can provide pooled upstream connections.
#[async_trait]
pub trait Client: Send + Sync {
    /// Retrieves a single persistent connection.
    async fn conn(&self) -> Result<PooledConn>;

    /// Reads the historical connection counters for this client.
    fn stats(&self) -> ClientStats;
}

/// Monotonic counters of connection acquisitions served by a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// The number of connection requests served successfully.
    pub successful: u64,
    /// The number of connection requests that failed.
    pub failed: u64,
}

/// TLS client configuration options.
#[derive(Debug, Clone, Copy)]
pub struct TlsClientOpts {
    /// Connection pool options.
    pub pool_opts: PersistentConnPoolOpts,
    /// Timeout for establishing the TCP connection. Zero disables it.
    pub connect_timeout: Duration,
    /// Timeout for completing the TLS handshake. Zero disables it.
    pub handshake_timeout: Duration,
    /// Timeout applied to each read from an established connection.
    pub read_timeout: Duration,
    /// Timeout applied to each write to an established connection.
    pub write_timeout: Duration,
}

/// A TLS-secured TCP client that recycles connections in a pool.
pub struct TlsClient {
    addr: String,
    pool: PersistentConnPool,
    stats: RwLock<ClientStats>,
}

impl TlsClient {
    /// Creates a TLS client pool connected to the specified remote address,
    /// verifying the remote's identity against `server_name`.
    ///
    /// The pool begins establishing its initial connections in the
    /// background; this constructor does not wait for them.
    pub fn new(
        addr: &str,
        server_name: &str,
        hook: Arc<dyn ConnectionLifecycleHook>,
        opts: TlsClientOpts,
    ) -> Result<Self> {
        let root_store = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };

        let mut tls_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(format!("failed to create TLS config: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

        // Session resumption cache shared across every dial to this
        // upstream, sized to the pool.
        tls_config.resumption = Resumption::store(Arc::new(ClientSessionMemoryCache::new(
            opts.pool_opts.capacity.max(1),
        )));

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::Tls(format!("invalid server name {server_name:?}: {e}")))?;

        let dialer = build_dialer(addr.to_string(), server_name, Arc::new(tls_config), opts);
        let pool = PersistentConnPool::new(dialer, hook, opts.pool_opts);

        Ok(Self {
            addr: addr.to_string(),
            pool,
            stats: RwLock::new(ClientStats::default()),
        })
    }

    /// The configured upstream address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// The number of connections currently cached in the pool.
    pub fn pool_size(&self) -> usize {
        self.pool.size()
    }
}

#[async_trait]
impl Client for TlsClient {
    async fn conn(&self) -> Result<PooledConn> {
        let result = self.pool.acquire().await;

        let mut stats = self.stats.write().unwrap();
        match &result {
            Ok(_) => stats.successful += 1,
            Err(_) => stats.failed += 1,
        }

        result
    }

    fn stats(&self) -> ClientStats {
        *self.stats.read().unwrap()
    }
}

fn build_dialer(
    addr: String,
    server_name: ServerName<'static>,
    tls_config: Arc<rustls::ClientConfig>,
    opts: TlsClientOpts,
) -> Dialer {
    Arc::new(move || {
        let addr = addr.clone();
        let server_name = server_name.clone();
        let tls_config = Arc::clone(&tls_config);

        Box::pin(async move {
            let stream = dial_tcp(&addr, opts.connect_timeout).await?;
            let peer = stream.peer_addr().ok();

            let connector = TlsConnector::from(tls_config);
            let tls_stream =
                maybe_timeout(opts.handshake_timeout, connector.connect(server_name, stream))
                    .await
                    .map_err(|e| Error::Tls(format!("handshake with {addr} failed: {e}")))?;

            Ok(Box::new(TimedStream::new(
                tls_stream,
                opts.read_timeout,
                opts.write_timeout,
                peer,
            )) as Box<dyn Conn>)
        })
    })
}

/// Opens a TCP connection to `addr` within `connect_timeout`, requesting
/// TCP Fast Open connect where the platform supports it.
async fn dial_tcp(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let target = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| Error::Client(format!("failed to resolve {addr}: {e}")))?
        .next()
        .ok_or_else(|| Error::Client(format!("no addresses resolved for {addr}")))?;

    maybe_timeout(connect_timeout, connect_stream(target))
        .await
        .map_err(|e| Error::Client(format!("error establishing connection to {addr}: {e}")))
}

async fn connect_stream(target: std::net::SocketAddr) -> std::io::Result<TcpStream> {
    let domain = if target.is_ipv6() {
        socket2::Domain::IPV6
    } else {
        socket2::Domain::IPV4
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

    fastopen::enable_connect(&socket);
    socket.set_nonblocking(true)?;

    // EINPROGRESS (115 on Linux, 36 on macOS) or WouldBlock indicates the
    // connection is in progress on a non-blocking socket.
    match socket.connect(&target.into()) {
        Ok(()) => {}
        Err(e)
            if e.raw_os_error() == Some(115)
                || e.raw_os_error() == Some(36)
                || e.kind() == std::io::ErrorKind::WouldBlock => {}
        Err(e) => return Err(e),
    }

    let std_stream: std::net::TcpStream = socket.into();
    let stream = TcpStream::from_std(std_stream)?;

    stream.ready(Interest::WRITABLE).await?;
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }

    Ok(stream)
}

/// TCP Fast Open support probing.
///
/// Fast Open connect is a Linux-specific socket option; on other platforms
/// the probe reports unsupported and the dial proceeds normally.
mod fastopen {
    #[cfg(target_os = "linux")]
    pub(super) fn enable_connect(socket: &socket2::Socket) -> bool {
        use std::os::fd::AsRawFd;

        let one: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_FASTOPEN_CONNECT,
                &one as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };

        if rc != 0 {
            tracing::debug!(
                "TCP fast open connect unavailable: {}",
                std::io::Error::last_os_error()
            );
            return false;
        }

        true
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn enable_connect(_socket: &socket2::Socket) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dotgate_metrics::NoopHook;

    fn opts(capacity: usize) -> TlsClientOpts {
        TlsClientOpts {
            pool_opts: PersistentConnPoolOpts {
                capacity,
                stale_timeout: Duration::ZERO,
            },
            connect_timeout: Duration::from_millis(200),
            handshake_timeout: Duration::from_millis(200),
            read_timeout: Duration::from_millis(200),
            write_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn client_creation_succeeds_without_reachable_upstream() {
        let client = TlsClient::new("127.0.0.1:1", "dns.example", Arc::new(NoopHook), opts(0));
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn invalid_server_name_is_rejected() {
        let client = TlsClient::new(
            "127.0.0.1:853",
            "not a hostname",
            Arc::new(NoopHook),
            opts(0),
        );
        assert!(matches!(client, Err(Error::Tls(_))));
    }

    #[tokio::test]
    async fn failed_acquire_increments_failed_counter() {
        // Nothing listens on the discard port of localhost; the dial fails
        // fast with a connection refusal.
        let client =
            TlsClient::new("127.0.0.1:1", "dns.example", Arc::new(NoopHook), opts(0)).unwrap();

        assert!(client.conn().await.is_err());
        assert_eq!(
            client.stats(),
            ClientStats {
                successful: 0,
                failed: 1
            }
        );

        assert!(client.conn().await.is_err());
        assert_eq!(client.stats().failed, 2);
    }
}
