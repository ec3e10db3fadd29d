//! Mock implementations for testing
//!
//! These mocks simulate the traits at the proxy's seams without touching
//! real sockets:
//!
//! - [`MockConn`]: a scripted [`Conn`] that serves canned bytes, captures
//!   writes, and can be told to fail reads or writes.
//! - [`MockClient`]: a [`Client`] that hands out scripted connections or
//!   scripted failures, counting every acquisition.
//! - [`CountingLifecycleHook`], [`CountingIoHook`], [`CountingProxyHook`]:
//!   hook implementations that count emissions.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use dotgate_metrics::{ConnectionIoHook, ConnectionLifecycleHook, ProxyHook};

use crate::client::{Client, ClientStats};
use crate::conn::Conn;
use crate::pool::PooledConn;
use crate::error::{Error, Result};

/// A scripted in-memory connection.
///
/// Reads drain the queued chunks one chunk per call; writes are captured for
/// later inspection. The drop flag, when provided, is raised when the
/// connection is dropped, which stands in for the underlying stream being
/// closed.
pub struct MockConn {
    reads: VecDeque<Vec<u8>>,
    written: Arc<Mutex<Vec<u8>>>,
    fail_reads: bool,
    fail_writes: bool,
    short_writes: bool,
    peer: Option<SocketAddr>,
    dropped: Option<Arc<AtomicBool>>,
}

impl MockConn {
    /// Creates a connection that serves the given read chunks in order.
    pub fn new(reads: Vec<Vec<u8>>) -> Self {
        Self {
            reads: reads.into(),
            written: Arc::new(Mutex::new(Vec::new())),
            fail_reads: false,
            fail_writes: false,
            short_writes: false,
            peer: None,
            dropped: None,
        }
    }

    /// Makes every read fail with a connection-reset error.
    pub fn fail_reads(mut self) -> Self {
        self.fail_reads = true;
        self
    }

    /// Makes every write fail with a broken-pipe error.
    pub fn fail_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }

    /// Makes every write report one byte fewer than requested.
    pub fn short_writes(mut self) -> Self {
        self.short_writes = true;
        self
    }

    /// Sets the peer address reported by the connection.
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Raises the given flag when the connection is dropped.
    pub fn with_drop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.dropped = Some(flag);
        self
    }

    /// A handle to the bytes written so far.
    pub fn written(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.written)
    }
}

impl Drop for MockConn {
    fn drop(&mut self) {
        if let Some(flag) = &self.dropped {
            flag.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Conn for MockConn {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_reads {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "scripted read failure",
            ));
        }

        match self.reads.front_mut() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n == chunk.len() {
                    self.reads.pop_front();
                } else {
                    chunk.drain(..n);
                }
                Ok(n)
            }
            None => Ok(0),
        }
    }

    async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted write failure",
            ));
        }

        self.written.lock().unwrap().extend_from_slice(buf);

        if self.short_writes {
            Ok(buf.len().saturating_sub(1))
        } else {
            Ok(buf.len())
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// One scripted outcome of a [`MockClient`] acquisition.
pub enum MockOutcome {
    /// Hand out a connection built by the factory.
    Conn(Box<dyn FnOnce() -> MockConn + Send>),
    /// Fail the acquisition.
    Fail,
}

/// A scripted upstream [`Client`].
///
/// Outcomes are served in order; once the script runs dry, every further
/// acquisition either succeeds with an empty connection or fails, per the
/// exhausted-script policy the client was built with.
pub struct MockClient {
    script: Mutex<VecDeque<MockOutcome>>,
    fail_when_exhausted: bool,
    attempts: AtomicUsize,
    stats: RwLock<ClientStats>,
    destroyed: Arc<AtomicUsize>,
    released: Arc<AtomicUsize>,
}

impl MockClient {
    /// Creates a client that always succeeds with empty connections.
    pub fn succeeding() -> Self {
        Self::with_script(Vec::new(), false)
    }

    /// Creates a client that always fails.
    pub fn failing() -> Self {
        Self::with_script(Vec::new(), true)
    }

    /// Creates a client that serves the given outcomes in order, then
    /// succeeds or fails per `fail_when_exhausted`.
    pub fn with_script(script: Vec<MockOutcome>, fail_when_exhausted: bool) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fail_when_exhausted,
            attempts: AtomicUsize::new(0),
            stats: RwLock::new(ClientStats::default()),
            destroyed: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Pre-seeds the success counter, for stats-driven policy tests.
    pub fn with_successful(self, successful: u64) -> Self {
        self.stats.write().unwrap().successful = successful;
        self
    }

    /// The number of acquisitions attempted against this client.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The number of connections this client handed out that were destroyed.
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// The number of connections this client handed out that were returned.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    fn wrap(&self, conn: MockConn) -> PooledConn {
        let destroyed = Arc::clone(&self.destroyed);
        let released = Arc::clone(&self.released);
        PooledConn::new(
            Box::new(conn),
            Box::new(move |_stream, was_destroyed| {
                if was_destroyed {
                    destroyed.fetch_add(1, Ordering::SeqCst);
                } else {
                    released.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
    }
}

#[async_trait]
impl Client for MockClient {
    async fn conn(&self) -> Result<PooledConn> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let outcome = self.script.lock().unwrap().pop_front();
        let result = match outcome {
            Some(MockOutcome::Conn(factory)) => Ok(self.wrap(factory())),
            Some(MockOutcome::Fail) => Err(Error::Client("scripted acquire failure".into())),
            None if self.fail_when_exhausted => {
                Err(Error::Client("scripted acquire failure".into()))
            }
            None => Ok(self.wrap(MockConn::new(Vec::new()))),
        };

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

/// A [`ConnectionLifecycleHook`] that counts emissions.
#[derive(Default)]
pub struct CountingLifecycleHook {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
    pub errors: AtomicUsize,
}

impl ConnectionLifecycleHook for CountingLifecycleHook {
    fn emit_open(&self, _latency: std::time::Duration, _addr: Option<SocketAddr>) {
        self.opens.fetch_add(1, Ordering::SeqCst);
    }

    fn emit_close(&self, _addr: Option<SocketAddr>) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    fn emit_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}

/// A [`ConnectionIoHook`] that counts emissions.
#[derive(Default)]
pub struct CountingIoHook {
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    pub read_errors: AtomicUsize,
    pub write_errors: AtomicUsize,
    pub retries: AtomicUsize,
}

impl ConnectionIoHook for CountingIoHook {
    fn emit_read(&self, _latency: std::time::Duration, _addr: Option<SocketAddr>) {
        self.reads.fetch_add(1, Ordering::SeqCst);
    }

    fn emit_write(&self, _latency: std::time::Duration, _addr: Option<SocketAddr>) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn emit_read_error(&self, _addr: Option<SocketAddr>) {
        self.read_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn emit_write_error(&self, _addr: Option<SocketAddr>) {
        self.write_errors.fetch_add(1, Ordering::SeqCst);
    }

    fn emit_retry(&self, _addr: Option<SocketAddr>) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }
}

/// A [`ProxyHook`] that counts emissions.
#[derive(Default)]
pub struct CountingProxyHook {
    pub processes: AtomicUsize,
    pub request_sizes: AtomicUsize,
    pub response_sizes: AtomicUsize,
    pub rtts: AtomicUsize,
    pub upstream_latencies: AtomicUsize,
    pub errors: AtomicUsize,
}

impl ProxyHook for CountingProxyHook {
    fn emit_process(&self, _client: Option<SocketAddr>, _upstream: Option<SocketAddr>) {
        self.processes.fetch_add(1, Ordering::SeqCst);
    }

    fn emit_request_size(&self, _bytes: usize, _client: Option<SocketAddr>) {
        self.request_sizes.fetch_add(1, Ordering::SeqCst);
    }

    fn emit_response_size(&self, _bytes: usize, _upstream: Option<SocketAddr>) {
        self.response_sizes.fetch_add(1, Ordering::SeqCst);
    }

    fn emit_rtt(
        &self,
        _latency: std::time::Duration,
        _client: Option<SocketAddr>,
        _upstream: Option<SocketAddr>,
        _transport: &str,
    ) {
        self.rtts.fetch_add(1, Ordering::SeqCst);
    }

    fn emit_upstream_latency(
        &self,
        _latency: std::time::Duration,
        _client: Option<SocketAddr>,
        _upstream: Option<SocketAddr>,
    ) {
        self.upstream_latencies.fetch_add(1, Ordering::SeqCst);
    }

    fn emit_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }
}
