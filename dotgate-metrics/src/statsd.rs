//! Minimal statsd wire client
//!
//! Emits statsd metric lines over a connected, non-blocking UDP socket. Tags
//! are serialized InfluxDB-style into the metric name, with URL escaping for
//! characters the statsd protocol cannot carry (colons in particular, which
//! appear in IPv6 addresses).

use std::io;
use std::net::{ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// An abstraction over a UDP statsd emitter.
///
/// All emission methods are fire-and-forget: the socket is non-blocking and
/// send failures are discarded, so a slow or absent statsd server never
/// stalls the caller.
pub struct StatsdClient {
    socket: UdpSocket,
    prefix: String,
    default_tags: Vec<(String, String)>,
    sample_rate: f32,
}

impl StatsdClient {
    /// Creates a new statsd client pointed at the specified server address,
    /// with a metric name prefix and a set of default tags included with
    /// every metric.
    pub fn new(
        addr: &str,
        prefix: &str,
        default_tags: Vec<(String, String)>,
        sample_rate: f32,
    ) -> io::Result<Self> {
        let target = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no statsd address resolved"))?;

        let socket = UdpSocket::bind(if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" })?;
        socket.connect(target)?;
        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            prefix: prefix.to_string(),
            default_tags,
            sample_rate,
        })
    }

    /// Emits a count metric with a configurable delta.
    pub fn count(&self, metric: &str, delta: i64, tags: &[(&str, &str)]) {
        self.send(metric, &delta.to_string(), "c", tags);
    }

    /// Emits a gauge metric.
    pub fn gauge(&self, metric: &str, value: i64, tags: &[(&str, &str)]) {
        self.send(metric, &value.to_string(), "g", tags);
    }

    /// Emits a time duration metric in milliseconds.
    pub fn timing(&self, metric: &str, duration: Duration, tags: &[(&str, &str)]) {
        self.send(metric, &duration.as_millis().to_string(), "ms", tags);
    }

    /// Emits a size metric as a number of bytes.
    ///
    /// Size metrics share semantics with timing metrics; they are interpreted
    /// and aggregated the same way.
    pub fn size(&self, metric: &str, bytes: usize, tags: &[(&str, &str)]) {
        self.send(metric, &bytes.to_string(), "ms", tags);
    }

    fn send(&self, metric: &str, value: &str, kind: &str, tags: &[(&str, &str)]) {
        if self.sample_rate < 1.0 && rand::random::<f32>() >= self.sample_rate {
            return;
        }

        let mut line = self.format_metric(metric, tags);
        line.push(':');
        line.push_str(value);
        line.push('|');
        line.push_str(kind);
        if self.sample_rate < 1.0 {
            line.push_str(&format!("|@{}", self.sample_rate));
        }

        // Fire-and-forget: a full socket buffer or an unreachable sink is
        // not the request path's problem.
        let _ = self.socket.send(line.as_bytes());
    }

    /// Serializes a metric name and tags (merged over the default tags) into
    /// a single statsd-compatible line prefix.
    fn format_metric(&self, metric: &str, tags: &[(&str, &str)]) -> String {
        let mut merged: Vec<(String, String)> = self.default_tags.clone();
        for (key, value) in tags {
            match merged.iter_mut().find(|(k, _)| k == key) {
                Some(entry) => entry.1 = (*value).to_string(),
                None => merged.push(((*key).to_string(), (*value).to_string())),
            }
        }

        let mut formatted = String::new();
        if !self.prefix.is_empty() {
            formatted.push_str(&self.prefix);
            formatted.push('.');
        }
        formatted.push_str(&escape(metric));

        for (key, value) in &merged {
            formatted.push(',');
            formatted.push_str(&escape(key));
            formatted.push('=');
            formatted.push_str(&escape(value));
        }

        formatted
    }
}

/// Escapes characters that are incompatible with the statsd line protocol,
/// using URL-style percent encoding. Unreserved URL characters pass through.
fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
