//! Metrics hook interfaces and their statsd implementations
//!
//! Three hook surfaces cover the proxy's observable behavior:
//!
//! - [`ConnectionLifecycleHook`]: TCP connection open/close/error events.
//!   Not pertinent to UDP transports, which are connectionless.
//! - [`ConnectionIoHook`]: read/write/retry events on an established
//!   connection, client- or upstream-side.
//! - [`ProxyHook`]: end-to-end events and latencies for a proxied request.
//!
//! Every method has a no-op default implementation, so [`NoopHook`] is a
//! valid stand-in for all three surfaces when metrics are disabled.

use std::net::SocketAddr;
use std::time::Duration;

use crate::statsd::StatsdClient;

/// Reports events that occur during a TCP connection lifecycle.
pub trait ConnectionLifecycleHook: Send + Sync {
    /// Reports that a connection was successfully opened.
    fn emit_open(&self, _latency: Duration, _addr: Option<SocketAddr>) {}

    /// Reports that a connection was closed.
    fn emit_close(&self, _addr: Option<SocketAddr>) {}

    /// Reports an error establishing a connection.
    fn emit_error(&self) {}
}

/// Reports I/O events on an established TCP or UDP connection.
pub trait ConnectionIoHook: Send + Sync {
    /// Reports a successful connection read.
    fn emit_read(&self, _latency: Duration, _addr: Option<SocketAddr>) {}

    /// Reports a successful connection write.
    fn emit_write(&self, _latency: Duration, _addr: Option<SocketAddr>) {}

    /// Reports a failed connection read.
    fn emit_read_error(&self, _addr: Option<SocketAddr>) {}

    /// Reports a failed connection write.
    fn emit_write_error(&self, _addr: Option<SocketAddr>) {}

    /// Reports that an I/O operation was retried due to failure.
    fn emit_retry(&self, _addr: Option<SocketAddr>) {}
}

/// Reports events and latencies related to end-to-end proxying of a client
/// request with an upstream server.
pub trait ProxyHook: Send + Sync {
    /// Reports that a request was proxied to completion.
    fn emit_process(&self, _client: Option<SocketAddr>, _upstream: Option<SocketAddr>) {}

    /// Reports the size of the proxied request on the wire.
    fn emit_request_size(&self, _bytes: usize, _client: Option<SocketAddr>) {}

    /// Reports the size of the proxied response on the wire.
    fn emit_response_size(&self, _bytes: usize, _upstream: Option<SocketAddr>) {}

    /// Reports the total end-to-end latency of serving a single request,
    /// including connection churn, the upstream transaction, and the
    /// response write back to the client.
    fn emit_rtt(
        &self,
        _latency: Duration,
        _client: Option<SocketAddr>,
        _upstream: Option<SocketAddr>,
        _transport: &str,
    ) {
    }

    /// Reports the latency of the upstream write/read transaction alone.
    fn emit_upstream_latency(
        &self,
        _latency: Duration,
        _client: Option<SocketAddr>,
        _upstream: Option<SocketAddr>,
    ) {
    }

    /// Reports an error in the proxy lifecycle that caused a request to go
    /// unserved.
    fn emit_error(&self) {}
}

/// Implements all three hook surfaces as no-ops.
pub struct NoopHook;

impl ConnectionLifecycleHook for NoopHook {}
impl ConnectionIoHook for NoopHook {}
impl ProxyHook for NoopHook {}

/// A [`ConnectionLifecycleHook`] that reports to statsd.
pub struct AsyncStatsdConnectionLifecycleHook {
    client: StatsdClient,
    source: String,
}

impl AsyncStatsdConnectionLifecycleHook {
    /// Creates a lifecycle hook reporting to the given statsd address. The
    /// source names the entity with whom connections are opened and closed
    /// (e.g. `"client"` or `"upstream"`).
    pub fn new(source: &str, addr: &str, sample_rate: f32) -> std::io::Result<Self> {
        Ok(Self {
            client: statsd_client_factory(addr, sample_rate)?,
            source: source.to_string(),
        })
    }
}

impl ConnectionLifecycleHook for AsyncStatsdConnectionLifecycleHook {
    fn emit_open(&self, latency: Duration, addr: Option<SocketAddr>) {
        let ip = ip_from_addr(addr);
        let tags = [("addr", ip.as_str())];

        self.client
            .count(&format!("event.{}.cx_open", self.source), 1, &tags);

        // Accept-side opens report a zero latency, which carries no signal.
        if latency > Duration::ZERO {
            self.client
                .timing(&format!("latency.{}.cx_open", self.source), latency, &tags);
        }
    }

    fn emit_close(&self, addr: Option<SocketAddr>) {
        let ip = ip_from_addr(addr);
        self.client.count(
            &format!("event.{}.cx_close", self.source),
            1,
            &[("addr", ip.as_str())],
        );
    }

    fn emit_error(&self) {
        self.client
            .count(&format!("event.{}.cx_error", self.source), 1, &[]);
    }
}

/// A [`ConnectionIoHook`] that reports to statsd.
pub struct AsyncStatsdConnectionIoHook {
    client: StatsdClient,
    source: String,
}

impl AsyncStatsdConnectionIoHook {
    /// Creates an I/O hook reporting to the given statsd address. The source
    /// names the entity with whom I/O is performed.
    pub fn new(source: &str, addr: &str, sample_rate: f32) -> std::io::Result<Self> {
        Ok(Self {
            client: statsd_client_factory(addr, sample_rate)?,
            source: source.to_string(),
        })
    }
}

impl ConnectionIoHook for AsyncStatsdConnectionIoHook {
    fn emit_read(&self, latency: Duration, addr: Option<SocketAddr>) {
        let ip = ip_from_addr(addr);
        self.client.timing(
            &format!("latency.{}.read", self.source),
            latency,
            &[("addr", ip.as_str())],
        );
    }

    fn emit_write(&self, latency: Duration, addr: Option<SocketAddr>) {
        let ip = ip_from_addr(addr);
        self.client.timing(
            &format!("latency.{}.write", self.source),
            latency,
            &[("addr", ip.as_str())],
        );
    }

    fn emit_read_error(&self, addr: Option<SocketAddr>) {
        let ip = ip_from_addr(addr);
        self.client.count(
            &format!("event.{}.read_error", self.source),
            1,
            &[("addr", ip.as_str())],
        );
    }

    fn emit_write_error(&self, addr: Option<SocketAddr>) {
        let ip = ip_from_addr(addr);
        self.client.count(
            &format!("event.{}.write_error", self.source),
            1,
            &[("addr", ip.as_str())],
        );
    }

    fn emit_retry(&self, addr: Option<SocketAddr>) {
        let ip = ip_from_addr(addr);
        self.client.count(
            &format!("event.{}.io_retry", self.source),
            1,
            &[("addr", ip.as_str())],
        );
    }
}

/// A [`ProxyHook`] that reports to statsd.
pub struct AsyncStatsdProxyHook {
    client: StatsdClient,
}

impl AsyncStatsdProxyHook {
    /// Creates a proxy hook reporting to the given statsd address.
    pub fn new(addr: &str, sample_rate: f32) -> std::io::Result<Self> {
        Ok(Self {
            client: statsd_client_factory(addr, sample_rate)?,
        })
    }
}

impl ProxyHook for AsyncStatsdProxyHook {
    fn emit_process(&self, client: Option<SocketAddr>, upstream: Option<SocketAddr>) {
        let client_ip = ip_from_addr(client);
        let upstream_ip = ip_from_addr(upstream);
        self.client.count(
            "event.proxy.process",
            1,
            &[
                ("client", client_ip.as_str()),
                ("upstream", upstream_ip.as_str()),
            ],
        );
    }

    fn emit_request_size(&self, bytes: usize, client: Option<SocketAddr>) {
        let ip = ip_from_addr(client);
        self.client
            .size("size.proxy.request", bytes, &[("addr", ip.as_str())]);
    }

    fn emit_response_size(&self, bytes: usize, upstream: Option<SocketAddr>) {
        let ip = ip_from_addr(upstream);
        self.client
            .size("size.proxy.response", bytes, &[("addr", ip.as_str())]);
    }

    fn emit_rtt(
        &self,
        latency: Duration,
        client: Option<SocketAddr>,
        upstream: Option<SocketAddr>,
        transport: &str,
    ) {
        let client_ip = ip_from_addr(client);
        let upstream_ip = ip_from_addr(upstream);
        self.client.timing(
            "latency.proxy.tx_rtt",
            latency,
            &[
                ("client", client_ip.as_str()),
                ("upstream", upstream_ip.as_str()),
                ("transport", transport),
            ],
        );
    }

    fn emit_upstream_latency(
        &self,
        latency: Duration,
        client: Option<SocketAddr>,
        upstream: Option<SocketAddr>,
    ) {
        let client_ip = ip_from_addr(client);
        let upstream_ip = ip_from_addr(upstream);
        self.client.timing(
            "latency.proxy.tx_upstream",
            latency,
            &[
                ("client", client_ip.as_str()),
                ("upstream", upstream_ip.as_str()),
            ],
        );
    }

    fn emit_error(&self) {
        self.client.count("event.proxy.error", 1, &[]);
    }
}

/// Creates a configured [`StatsdClient`] with the defaults shared by all
/// statsd hooks: the `dotgate` metric prefix and a `host` tag.
fn statsd_client_factory(addr: &str, sample_rate: f32) -> std::io::Result<StatsdClient> {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    StatsdClient::new(addr, "dotgate", vec![("host".into(), hostname)], sample_rate)
}

/// Returns the IP portion of an address for tagging, or `"null"` when the
/// address is unavailable.
fn ip_from_addr(addr: Option<SocketAddr>) -> String {
    match addr {
        Some(addr) => addr.ip().to_string(),
        None => "null".to_string(),
    }
}
