//! Persistent connection pool
//!
//! Long-lived upstream connections are expensive to establish (TCP plus a
//! TLS handshake), so they are cached and reused across requests instead of
//! being closed. The pool hands out [`PooledConn`] wrappers whose release
//! path decides between reinsertion and teardown: a connection that just
//! completed a healthy transaction goes back into the pool, while one that
//! failed mid-I/O is destroyed.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dotgate_metrics::{ConnectionLifecycleHook, Stopwatch};

use crate::conn::Conn;
use crate::error::Result;
use crate::mru::MruQueue;

/// A connection factory describing how the pool establishes a new upstream
/// connection.
pub type Dialer =
    Arc<dyn Fn() -> Pin<Box<dyn Future<Output = Result<Box<dyn Conn>>> + Send>> + Send + Sync>;

/// The release callback a [`PooledConn`] invokes exactly once, with the
/// underlying stream and a flag reporting whether the connection was
/// destroyed.
pub type Closer = Box<dyn FnOnce(Box<dyn Conn>, bool) + Send>;

/// Configuration options for a persistent connection pool.
#[derive(Debug, Clone, Copy)]
pub struct PersistentConnPoolOpts {
    /// The maximum number of cached connections held open in the pool.
    /// Depending on client and server behavior, the number of connections
    /// open at any time may exceed this capacity; only the cached residue is
    /// bounded. A capacity of zero disables caching entirely.
    pub capacity: usize,

    /// The idle duration after which a cached connection is considered
    /// stale and reconnected before use. Zero disables staleness checks.
    pub stale_timeout: Duration,
}

struct PoolInner {
    dialer: Dialer,
    hook: Arc<dyn ConnectionLifecycleHook>,
    stale_timeout: Duration,
    conns: MruQueue<Box<dyn Conn>>,
}

impl PoolInner {
    fn release(&self, stream: Box<dyn Conn>, destroyed: bool) {
        if destroyed {
            self.hook.emit_close(stream.peer_addr());
            // Dropping the stream closes the underlying socket.
            return;
        }

        // Reinsert for reuse; at capacity, the surplus connection is simply
        // closed. No close observation is emitted for a capacity overflow.
        let _ = self.conns.push(stream);
    }
}

/// A pool of persistent, long-lived connections. Connections are returned
/// to the pool instead of closed, for later reuse.
pub struct PersistentConnPool {
    inner: Arc<PoolInner>,
}

impl PersistentConnPool {
    /// Creates a pool with the given dialer, connection-lifecycle hook, and
    /// options, and begins populating it in the background.
    ///
    /// The fill is best-effort: a dial failure leaves a vacancy that a later
    /// [`acquire`](Self::acquire) fills on demand. Must be called within a
    /// Tokio runtime.
    pub fn new(
        dialer: Dialer,
        hook: Arc<dyn ConnectionLifecycleHook>,
        opts: PersistentConnPoolOpts,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            dialer,
            hook,
            stale_timeout: opts.stale_timeout,
            conns: MruQueue::bounded(opts.capacity),
        });

        let fill = Arc::clone(&inner);
        tokio::spawn(async move {
            for _ in 0..opts.capacity {
                let dial_timer = Stopwatch::start();
                match (fill.dialer)().await {
                    Ok(stream) => {
                        fill.hook.emit_open(dial_timer.elapsed(), stream.peer_addr());
                        let _ = fill.conns.push(stream);
                    }
                    Err(e) => {
                        tracing::debug!("pool: initial dial failed: {e}");
                        fill.hook.emit_error();
                    }
                }
            }
        });

        Self { inner }
    }

    /// Returns a single live connection: a cached one when a fresh entry is
    /// available, or a newly dialed one otherwise.
    pub async fn acquire(&self) -> Result<PooledConn> {
        if let Some((stream, pushed_at)) = self.inner.conns.pop() {
            if self.inner.stale_timeout.is_zero()
                || pushed_at.elapsed() < self.inner.stale_timeout
            {
                return Ok(self.wrap(stream));
            }

            // The connection sat idle past the stale timeout and is presumed
            // half-closed by the remote; discard it and dial fresh.
            self.inner.hook.emit_close(stream.peer_addr());
            drop(stream);
        }

        let dial_timer = Stopwatch::start();
        match (self.inner.dialer)().await {
            Ok(stream) => {
                self.inner.hook.emit_open(dial_timer.elapsed(), stream.peer_addr());
                Ok(self.wrap(stream))
            }
            Err(e) => {
                self.inner.hook.emit_error();
                Err(e)
            }
        }
    }

    /// Reports the current number of cached connections.
    pub fn size(&self) -> usize {
        self.inner.conns.len()
    }

    fn wrap(&self, stream: Box<dyn Conn>) -> PooledConn {
        // The wrapper must not keep the pool alive: connections checked out
        // at shutdown release into nothing.
        let pool: Weak<PoolInner> = Arc::downgrade(&self.inner);
        PooledConn::new(
            stream,
            Box::new(move |stream, destroyed| {
                if let Some(pool) = pool.upgrade() {
                    pool.release(stream, destroyed);
                }
            }),
        )
    }
}

/// A pooled connection wrapper.
///
/// Instead of closing the underlying stream, [`release`](Self::release)
/// invokes the owning pool's release path for reinsertion;
/// [`destroy`](Self::destroy) forcefully closes it. Both consume the
/// wrapper, so a connection is returned or destroyed at most once. A
/// wrapper dropped without an explicit release counts as destroyed.
pub struct PooledConn {
    stream: Option<Box<dyn Conn>>,
    closer: Option<Closer>,
}

impl std::fmt::Debug for PooledConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConn")
            .field("stream", &self.stream.is_some())
            .field("closer", &self.closer.is_some())
            .finish()
    }
}

impl PooledConn {
    /// Wraps a stream with the given release callback.
    pub fn new(stream: Box<dyn Conn>, closer: Closer) -> Self {
        Self {
            stream: Some(stream),
            closer: Some(closer),
        }
    }

    /// Returns the connection to its pool for reuse.
    pub fn release(mut self) {
        self.finish(false);
    }

    /// Marks the connection as destroyed and closes the underlying stream.
    pub fn destroy(mut self) {
        self.finish(true);
    }

    fn finish(&mut self, destroyed: bool) {
        if let (Some(stream), Some(closer)) = (self.stream.take(), self.closer.take()) {
            closer(stream, destroyed);
        }
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        self.finish(true);
    }
}

fn gone() -> io::Error {
    io::Error::other("pooled connection already released")
}

#[async_trait]
impl Conn for PooledConn {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.read(buf).await,
            None => Err(gone()),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stream.as_mut() {
            Some(stream) => stream.write(buf).await,
            None => Err(gone()),
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self.stream.as_mut() {
            Some(stream) => stream.read_exact(buf).await,
            None => Err(gone()),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|stream| stream.peer_addr())
    }
}
