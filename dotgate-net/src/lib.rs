//! dotgate-net - pooled upstream networking for the dotgate proxy
//!
//! This crate provides the upstream engine of a DNS-over-TLS forwarding
//! proxy:
//!
//! - A per-upstream pool of persistent TLS connections with MRU reuse,
//!   staleness eviction, and destroy-on-failure semantics
//! - A sharded client that multiplexes several upstream pools behind
//!   pluggable load balancing policies (round robin, random, historical
//!   connections, availability with exponential backoff, failover)
//! - Transport adapters giving TCP streams and single-exchange UDP sockets
//!   one uniform, deadline-bounded byte-stream interface
//! - Listener drivers that feed accepted client connections to a handler
//!
//! DNS messages are treated as opaque payloads throughout; nothing in this
//! crate parses them.

mod client;
mod conn;
pub mod error;
pub mod mock;
mod mru;
mod pool;
mod server;
mod sharding;

pub use client::{Client, ClientStats, TlsClient, TlsClientOpts};
pub use conn::{Conn, TimedStream, UdpConn};
pub use error::{Error, Result};
pub use mru::MruQueue;
pub use pool::{
    Closer, Dialer, PersistentConnPool, PersistentConnPoolOpts, PooledConn,
};
pub use server::{
    BoxError, ServerHandler, TcpServer, TcpServerOpts, Transport, UdpServer, UdpServerOpts,
};
pub use sharding::{LoadBalancingPolicy, ShardedClient};
