//! Application configuration
//!
//! The configuration file is TOML with four top-level blocks: `application`,
//! `metrics`, `listener`, and `upstream`. Timeouts are duration strings in
//! the `"250ms"` / `"5s"` / `"1m30s"` style.
//!
//! # Example configuration
//!
//! ```toml
//! [metrics.statsd]
//! addr = "127.0.0.1:8125"
//! sample_rate = 1.0
//!
//! [listener.udp]
//! addr = "0.0.0.0:53"
//! max_concurrent_connections = 32
//!
//! [upstream]
//! load_balancing_policy = "Availability"
//!
//! [[upstream.servers]]
//! addr = "1.1.1.1:853"
//! server_name = "cloudflare-dns.com"
//! connection_pool_size = 8
//! stale_timeout = "5m"
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use dotgate_net::LoadBalancingPolicy;

/// Top-level block for application-level meta configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplicationConfig {
    /// Error-reporting backend DSN; absence disables error reporting.
    #[serde(default)]
    pub sentry_dsn: Option<String>,
}

/// Top-level block for metrics configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Statsd sink parameters; absence disables metrics reporting.
    #[serde(default)]
    pub statsd: Option<StatsdConfig>,
}

/// Statsd sink parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsdConfig {
    /// Statsd server address.
    #[serde(default)]
    pub addr: String,

    /// Metric sample rate in [0.0, 1.0].
    #[serde(default)]
    pub sample_rate: f32,
}

/// Top-level block for server listener configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListenerConfig {
    /// TCP listener parameters.
    #[serde(default)]
    pub tcp: Option<TcpListenerConfig>,

    /// UDP listener parameters.
    #[serde(default)]
    pub udp: Option<UdpListenerConfig>,
}

/// TCP listener parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TcpListenerConfig {
    /// Listening address.
    #[serde(default)]
    pub addr: String,

    /// Maximum time to wait for a client read after the connection is
    /// established.
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub read_timeout: Duration,

    /// Maximum time allowed to write a response back to a client.
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub write_timeout: Duration,
}

/// UDP listener parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UdpListenerConfig {
    /// Listening address.
    #[serde(default)]
    pub addr: String,

    /// Number of concurrent worker tasks serving datagrams.
    #[serde(default)]
    pub max_concurrent_connections: usize,

    /// Maximum time between a worker starting to listen and a client
    /// sending data.
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub read_timeout: Duration,

    /// Maximum time allowed to write a response back to a client.
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub write_timeout: Duration,
}

/// Parameters for a single upstream server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamServer {
    /// Upstream `host:port`.
    #[serde(default)]
    pub addr: String,

    /// Hostname used for SNI and TLS identity verification.
    #[serde(default)]
    pub server_name: String,

    /// Persistent connection pool capacity.
    #[serde(default)]
    pub connection_pool_size: usize,

    /// Timeout for establishing the TCP connection.
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub connect_timeout: Duration,

    /// Timeout for completing the TLS handshake.
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub handshake_timeout: Duration,

    /// Per-read deadline on upstream connections.
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub read_timeout: Duration,

    /// Per-write deadline on upstream connections.
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub write_timeout: Duration,

    /// Idle duration after which a pooled connection is reconnected before
    /// use.
    #[serde(default, deserialize_with = "duration::deserialize")]
    pub stale_timeout: Duration,
}

/// Top-level block for upstream configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamConfig {
    /// Load balancing policy name; empty selects round robin.
    #[serde(default)]
    pub load_balancing_policy: String,

    /// Maximum upstream transaction retries per request; zero or negative
    /// selects the default.
    #[serde(default)]
    pub max_connection_retries: i64,

    /// Configured upstream servers.
    #[serde(default)]
    pub servers: Vec<UpstreamServer>,
}

/// All application configuration options.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Application-level meta configuration.
    #[serde(default)]
    pub application: Option<ApplicationConfig>,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: Option<MetricsConfig>,

    /// Server listener configuration.
    #[serde(default)]
    pub listener: Option<ListenerConfig>,

    /// Upstream configuration.
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
}

impl Config {
    /// Loads and validates configuration from a file on disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// The load balancing policy selected by the configuration.
    pub fn load_balancing_policy(&self) -> LoadBalancingPolicy {
        self.upstream
            .as_ref()
            .filter(|upstream| !upstream.load_balancing_policy.is_empty())
            // Validation already rejected unknown names.
            .and_then(|upstream| {
                LoadBalancingPolicy::from_str(&upstream.load_balancing_policy).ok()
            })
            .unwrap_or_default()
    }

    /// Validates the contents of the configuration.
    fn validate(&self) -> Result<()> {
        // Users can omit the metrics block entirely to disable metrics
        // reporting.
        if let Some(statsd) = self.metrics.as_ref().and_then(|m| m.statsd.as_ref()) {
            if statsd.addr.is_empty() {
                return Err(Error::Config("missing metrics statsd address".into()));
            }

            if !(0.0..=1.0).contains(&statsd.sample_rate) {
                return Err(Error::Config(
                    "statsd sample rate must be in range [0.0, 1.0]".into(),
                ));
            }
        }

        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Config("missing top-level listener config key".into()))?;

        if listener.tcp.is_none() && listener.udp.is_none() {
            return Err(Error::Config(
                "at least one TCP or UDP listener must be specified".into(),
            ));
        }

        if let Some(tcp) = &listener.tcp {
            if tcp.addr.is_empty() {
                return Err(Error::Config("missing TCP server listening address".into()));
            }
        }

        if let Some(udp) = &listener.udp {
            if udp.addr.is_empty() {
                return Err(Error::Config("missing UDP server listening address".into()));
            }
        }

        let upstream = self
            .upstream
            .as_ref()
            .ok_or_else(|| Error::Config("missing top-level upstream config key".into()))?;

        // Validate the load balancing policy only if provided; empty
        // signifies the default.
        if !upstream.load_balancing_policy.is_empty()
            && LoadBalancingPolicy::from_str(&upstream.load_balancing_policy).is_err()
        {
            return Err(Error::Config(format!(
                "unknown load balancing policy: {}",
                upstream.load_balancing_policy
            )));
        }

        if upstream.servers.is_empty() {
            return Err(Error::Config("no upstream servers specified".into()));
        }

        for (idx, server) in upstream.servers.iter().enumerate() {
            if server.addr.is_empty() {
                return Err(Error::Config(format!("missing server address: idx={idx}")));
            }

            if server.server_name.is_empty() {
                return Err(Error::Config(format!(
                    "missing server TLS hostname: idx={idx}"
                )));
            }
        }

        Ok(())
    }
}

/// Duration-string parsing for configuration values.
pub mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    /// Parses a duration string composed of one or more `<integer><unit>`
    /// segments, with units `ns`, `us`, `ms`, `s`, `m`, and `h`. Segments
    /// accumulate, so `"1m30s"` is ninety seconds. A bare `"0"` is zero.
    pub fn parse(input: &str) -> Result<Duration, String> {
        let input = input.trim();
        if input.is_empty() {
            return Err("empty duration".to_string());
        }
        if input == "0" {
            return Ok(Duration::ZERO);
        }

        let bytes = input.as_bytes();
        let mut total = Duration::ZERO;
        let mut i = 0;

        while i < bytes.len() {
            let digits_start = i;
            while i < bytes.len() && bytes[i].is_ascii_digit() {
                i += 1;
            }
            if i == digits_start {
                return Err(format!("invalid duration {input:?}"));
            }

            let value: u64 = input[digits_start..i]
                .parse()
                .map_err(|_| format!("invalid duration value in {input:?}"))?;

            let unit_start = i;
            while i < bytes.len() && !bytes[i].is_ascii_digit() {
                i += 1;
            }

            total += match &input[unit_start..i] {
                "ns" => Duration::from_nanos(value),
                "us" | "µs" => Duration::from_micros(value),
                "ms" => Duration::from_millis(value),
                "s" => Duration::from_secs(value),
                "m" => Duration::from_secs(value * 60),
                "h" => Duration::from_secs(value * 3600),
                unit => return Err(format!("invalid duration unit {unit:?} in {input:?}")),
            };
        }

        Ok(total)
    }

    /// Serde adapter for duration-string fields.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_CONFIG: &str = r#"
        [application]
        sentry_dsn = "https://key@sentry.example/42"

        [metrics.statsd]
        addr = "127.0.0.1:8125"
        sample_rate = 0.5

        [listener.tcp]
        addr = "0.0.0.0:53"
        read_timeout = "2s"
        write_timeout = "2s"

        [listener.udp]
        addr = "0.0.0.0:53"
        max_concurrent_connections = 32
        read_timeout = "0"
        write_timeout = "500ms"

        [upstream]
        load_balancing_policy = "availability"
        max_connection_retries = 8

        [[upstream.servers]]
        addr = "1.1.1.1:853"
        server_name = "cloudflare-dns.com"
        connection_pool_size = 8
        connect_timeout = "1s"
        handshake_timeout = "3s"
        read_timeout = "2s"
        write_timeout = "2s"
        stale_timeout = "5m"

        [[upstream.servers]]
        addr = "9.9.9.9:853"
        server_name = "dns.quad9.net"
    "#;

    #[test]
    fn full_config_parses() {
        let config = Config::from_toml(FULL_CONFIG).unwrap();

        assert_eq!(
            config.application.unwrap().sentry_dsn.as_deref(),
            Some("https://key@sentry.example/42")
        );

        let statsd = config.metrics.unwrap().statsd.unwrap();
        assert_eq!(statsd.addr, "127.0.0.1:8125");
        assert_eq!(statsd.sample_rate, 0.5);

        let listener = config.listener.unwrap();
        assert_eq!(listener.tcp.as_ref().unwrap().read_timeout, Duration::from_secs(2));
        let udp = listener.udp.unwrap();
        assert_eq!(udp.max_concurrent_connections, 32);
        assert_eq!(udp.read_timeout, Duration::ZERO);
        assert_eq!(udp.write_timeout, Duration::from_millis(500));

        let upstream = config.upstream.unwrap();
        assert_eq!(upstream.max_connection_retries, 8);
        assert_eq!(upstream.servers.len(), 2);
        assert_eq!(upstream.servers[0].connection_pool_size, 8);
        assert_eq!(upstream.servers[0].stale_timeout, Duration::from_secs(300));
        assert_eq!(upstream.servers[1].connect_timeout, Duration::ZERO);
    }

    #[test]
    fn policy_accessor_defaults_to_round_robin() {
        let config = Config::from_toml(
            r#"
            [listener.udp]
            addr = "127.0.0.1:5353"

            [[upstream.servers]]
            addr = "1.1.1.1:853"
            server_name = "cloudflare-dns.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.load_balancing_policy(), LoadBalancingPolicy::RoundRobin);
    }

    #[test]
    fn policy_accessor_parses_configured_policy() {
        let config = Config::from_toml(FULL_CONFIG).unwrap();
        assert_eq!(
            config.load_balancing_policy(),
            LoadBalancingPolicy::Availability
        );
    }

    #[test]
    fn missing_listener_block_is_rejected() {
        let err = Config::from_toml(
            r#"
            [[upstream.servers]]
            addr = "1.1.1.1:853"
            server_name = "cloudflare-dns.com"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("listener"));
    }

    #[test]
    fn listener_without_any_transport_is_rejected() {
        let err = Config::from_toml(
            r#"
            [listener]

            [[upstream.servers]]
            addr = "1.1.1.1:853"
            server_name = "cloudflare-dns.com"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("at least one"));
    }

    #[test]
    fn tcp_listener_requires_an_address() {
        let err = Config::from_toml(
            r#"
            [listener.tcp]
            read_timeout = "1s"

            [[upstream.servers]]
            addr = "1.1.1.1:853"
            server_name = "cloudflare-dns.com"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("TCP server listening address"));
    }

    #[test]
    fn empty_upstream_servers_are_rejected() {
        let err = Config::from_toml(
            r#"
            [listener.udp]
            addr = "127.0.0.1:5353"

            [upstream]
            load_balancing_policy = "Random"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no upstream servers"));
    }

    #[test]
    fn server_without_tls_hostname_is_rejected() {
        let err = Config::from_toml(
            r#"
            [listener.udp]
            addr = "127.0.0.1:5353"

            [[upstream.servers]]
            addr = "1.1.1.1:853"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("missing server TLS hostname: idx=0"));
    }

    #[test]
    fn unknown_policy_is_fatal() {
        let err = Config::from_toml(
            r#"
            [listener.udp]
            addr = "127.0.0.1:5353"

            [upstream]
            load_balancing_policy = "LeastConn"

            [[upstream.servers]]
            addr = "1.1.1.1:853"
            server_name = "cloudflare-dns.com"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown load balancing policy"));
    }

    #[test]
    fn statsd_sample_rate_out_of_range_is_rejected() {
        let err = Config::from_toml(
            r#"
            [metrics.statsd]
            addr = "127.0.0.1:8125"
            sample_rate = 1.5

            [listener.udp]
            addr = "127.0.0.1:5353"

            [[upstream.servers]]
            addr = "1.1.1.1:853"
            server_name = "cloudflare-dns.com"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("sample rate"));
    }

    #[test]
    fn statsd_without_address_is_rejected() {
        let err = Config::from_toml(
            r#"
            [metrics.statsd]
            sample_rate = 1.0

            [listener.udp]
            addr = "127.0.0.1:5353"

            [[upstream.servers]]
            addr = "1.1.1.1:853"
            server_name = "cloudflare-dns.com"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("statsd address"));
    }

    #[test]
    fn duration_parser_handles_units_and_segments() {
        assert_eq!(duration::parse("0").unwrap(), Duration::ZERO);
        assert_eq!(duration::parse("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(duration::parse("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(duration::parse("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(duration::parse("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(duration::parse("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(
            duration::parse("1s500ms").unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(duration::parse("10us").unwrap(), Duration::from_micros(10));
    }

    #[test]
    fn duration_parser_rejects_garbage() {
        assert!(duration::parse("").is_err());
        assert!(duration::parse("5").is_err());
        assert!(duration::parse("fast").is_err());
        assert!(duration::parse("5 s").is_err());
        assert!(duration::parse("5sec").is_err());
    }
}
