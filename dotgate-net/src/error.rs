//! Error types for network operations

use thiserror::Error;

/// Result type alias for network operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while dialing, pooling, or sharding upstream
/// connections
#[derive(Debug, Error)]
pub enum Error {
    /// Upstream client error
    #[error("client error: {0}")]
    Client(String),

    /// TLS configuration or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Unrecognized load balancing policy name
    #[error("unknown load balancing policy: {0}")]
    UnknownPolicy(String),

    /// No sharded client is currently eligible to provide a connection
    #[error("no live clients are available")]
    NoLiveClients,

    /// Every sharded client failed to provide a connection
    #[error("all clients failed to provide a connection")]
    AllClientsFailed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
