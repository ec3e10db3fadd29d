//! dotgate - a DNS-over-TLS forwarding proxy
//!
//! Accepts plaintext DNS queries over UDP and TCP and relays them to
//! TLS-secured upstream resolvers over pooled, persistent connections.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dotgate_engine::{Config, ErrorSink, NoopErrorSink, ProxyHandler, ProxyHandlerOpts};
use dotgate_metrics::{
    AsyncStatsdConnectionIoHook, AsyncStatsdConnectionLifecycleHook, AsyncStatsdProxyHook,
    ConnectionIoHook, ConnectionLifecycleHook, NoopHook, ProxyHook,
};
use dotgate_net::{
    Client, PersistentConnPoolOpts, ShardedClient, TcpServer, TcpServerOpts, TlsClient,
    TlsClientOpts, Transport, UdpServer, UdpServerOpts,
};

/// DNS-over-TLS forwarding proxy
#[derive(Parser)]
#[command(name = "dotgate", version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file on disk
    #[arg(long, env = "DOTGATE_CONFIG")]
    config: PathBuf,

    /// Desired logging verbosity: one of error, warn, info, debug
    #[arg(long, default_value = "error")]
    verbosity: String,
}

/// The full set of metrics hooks the proxy is wired with.
struct Hooks {
    client_lifecycle: Arc<dyn ConnectionLifecycleHook>,
    upstream_lifecycle: Arc<dyn ConnectionLifecycleHook>,
    client_io: Arc<dyn ConnectionIoHook>,
    upstream_io: Arc<dyn ConnectionIoHook>,
    proxy: Arc<dyn ProxyHook>,
}

impl Hooks {
    fn noop() -> Self {
        Self {
            client_lifecycle: Arc::new(NoopHook),
            upstream_lifecycle: Arc::new(NoopHook),
            client_io: Arc::new(NoopHook),
            upstream_io: Arc::new(NoopHook),
            proxy: Arc::new(NoopHook),
        }
    }

    fn statsd(addr: &str, sample_rate: f32) -> Result<Self> {
        Ok(Self {
            client_lifecycle: Arc::new(
                AsyncStatsdConnectionLifecycleHook::new("client", addr, sample_rate)
                    .context("failed to create client lifecycle hook")?,
            ),
            upstream_lifecycle: Arc::new(
                AsyncStatsdConnectionLifecycleHook::new("upstream", addr, sample_rate)
                    .context("failed to create upstream lifecycle hook")?,
            ),
            client_io: Arc::new(
                AsyncStatsdConnectionIoHook::new("client", addr, sample_rate)
                    .context("failed to create client I/O hook")?,
            ),
            upstream_io: Arc::new(
                AsyncStatsdConnectionIoHook::new("upstream", addr, sample_rate)
                    .context("failed to create upstream I/O hook")?,
            ),
            proxy: Arc::new(
                AsyncStatsdProxyHook::new(addr, sample_rate)
                    .context("failed to create proxy hook")?,
            ),
        })
    }
}

/// Reports request failures to the configured Sentry backend.
struct SentryErrorSink;

impl ErrorSink for SentryErrorSink {
    fn report(&self, transport: Transport, err: &(dyn std::error::Error + 'static)) {
        sentry::with_scope(
            |scope| scope.set_tag("transport", transport.to_string()),
            || sentry::capture_message(&err.to_string(), sentry::Level::Error),
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.verbosity);

    info!("reading and parsing config: path={:?}", cli.config);
    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {:?}", cli.config))?;

    // Error reporting is optional; without a DSN the sink is a no-op.
    let mut _sentry_guard = None;
    let error_sink: Arc<dyn ErrorSink> = match config
        .application
        .as_ref()
        .and_then(|app| app.sentry_dsn.as_deref())
    {
        Some(dsn) if !dsn.is_empty() => {
            _sentry_guard = Some(sentry::init((
                dsn,
                sentry::ClientOptions {
                    release: sentry::release_name!(),
                    ..Default::default()
                },
            )));
            Arc::new(SentryErrorSink)
        }
        _ => Arc::new(NoopErrorSink),
    };

    let hooks = match config.metrics.as_ref().and_then(|m| m.statsd.as_ref()) {
        Some(statsd) => {
            info!(
                "configuring statsd metrics reporting: addr={} sample_rate={}",
                statsd.addr, statsd.sample_rate,
            );
            Hooks::statsd(&statsd.addr, statsd.sample_rate)?
        }
        None => {
            warn!("no metrics output engine specified; disabling metrics");
            Hooks::noop()
        }
    };

    let upstream_config = config
        .upstream
        .clone()
        .context("upstream configuration is required")?;

    let mut servers: Vec<Arc<dyn Client>> = Vec::with_capacity(upstream_config.servers.len());
    for server in &upstream_config.servers {
        let opts = TlsClientOpts {
            pool_opts: PersistentConnPoolOpts {
                capacity: server.connection_pool_size,
                stale_timeout: server.stale_timeout,
            },
            connect_timeout: server.connect_timeout,
            handshake_timeout: server.handshake_timeout,
            read_timeout: server.read_timeout,
            write_timeout: server.write_timeout,
        };

        info!(
            "starting TLS client for upstream server: addr={} name={} conns={}",
            server.addr, server.server_name, opts.pool_opts.capacity,
        );

        let client = TlsClient::new(
            &server.addr,
            &server.server_name,
            Arc::clone(&hooks.upstream_lifecycle),
            opts,
        )
        .with_context(|| format!("failed to create TLS client for {}", server.addr))?;

        servers.push(Arc::new(client));
    }

    let policy = config.load_balancing_policy();
    info!("using load balancing policy for request sharding: policy={policy}");

    let sharded = ShardedClient::new(servers, policy)
        .context("failed to create sharded upstream client")?;

    let handler = Arc::new(ProxyHandler::new(
        Arc::new(sharded),
        Arc::clone(&hooks.client_io),
        Arc::clone(&hooks.upstream_io),
        Arc::clone(&hooks.proxy),
        error_sink,
        ProxyHandlerOpts {
            max_upstream_retries: upstream_config.max_connection_retries,
        },
    ));

    let listener = config
        .listener
        .clone()
        .context("listener configuration is required")?;

    if let Some(udp) = &listener.udp {
        info!(
            "configuring UDP server listener: addr={} max_concurrent_conns={}",
            udp.addr, udp.max_concurrent_connections,
        );

        let server = UdpServer::bind(
            &udp.addr,
            UdpServerOpts {
                max_concurrent_connections: udp.max_concurrent_connections,
                read_timeout: udp.read_timeout,
                write_timeout: udp.write_timeout,
            },
        )
        .await
        .with_context(|| format!("failed to bind UDP listener on {}", udp.addr))?;

        spawn_server(server.serve(Arc::clone(&handler)), "udp");
    }

    if let Some(tcp) = &listener.tcp {
        info!("configuring TCP server listener: addr={}", tcp.addr);

        let server = TcpServer::bind(
            &tcp.addr,
            Arc::clone(&hooks.client_lifecycle),
            TcpServerOpts {
                read_timeout: tcp.read_timeout,
                write_timeout: tcp.write_timeout,
            },
        )
        .await
        .with_context(|| format!("failed to bind TCP listener on {}", tcp.addr))?;

        spawn_server(server.serve(Arc::clone(&handler)), "tcp");
    }

    info!("serving indefinitely");
    wait_for_shutdown().await;
    info!("shutting down");

    Ok(())
}

fn init_logging(verbosity: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(verbosity));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn spawn_server<F>(serve: F, name: &'static str)
where
    F: std::future::Future<Output = dotgate_net::Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = serve.await {
            error!("{name} server terminated: {e}");
        }
    });
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to register SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.expect("failed to listen for ctrl-c");
        info!("received ctrl-c");
    }
}
