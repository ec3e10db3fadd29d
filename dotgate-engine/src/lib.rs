//! dotgate-engine - configuration and request handling for the dotgate
//! proxy
//!
//! This crate ties the networking layer to a running proxy: it parses and
//! validates the application configuration, and implements the per-request
//! state machine that relays DNS messages between clients and the sharded
//! upstream client.

pub mod config;
pub mod error;
mod proxy;

pub use config::Config;
pub use error::{Error, Result};
pub use proxy::{ErrorSink, NoopErrorSink, ProxyHandler, ProxyHandlerOpts};
