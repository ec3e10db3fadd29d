//! Error types for the proxy engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while configuring or running the proxy
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("config: {0}")]
    Config(String),

    /// Failed to parse the configuration file
    #[error("config: failed to parse: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Upstream networking error
    #[error("network error: {0}")]
    Net(#[from] dotgate_net::Error),

    /// Per-request proxy failure
    #[error("dns_proxy: {0}")]
    Proxy(String),
}
