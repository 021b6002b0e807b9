//! Typed error hierarchy.
//!
//! Errors are split along how they should be handled: `ConfigError` can be
//! fatal (first boot) or recoverable (reload, where the old config stays in
//! effect); `ControllerError` distinguishes transient failures the monitor
//! retries from `AuthDenied`, which is fatal; `InterposerError` never escapes
//! a single connection or a single server's port lifecycle.

use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors returned by the controller client. The monitor loop decides what
/// to do with each variant; the client itself never retries internally.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("transient network failure: {0}")]
    TransientNetwork(#[from] reqwest::Error),
    #[error("controller denied credentials")]
    AuthDenied,
    #[error("controller has no record of server {0}")]
    NotFound(String),
    #[error("controller returned malformed response: {0}")]
    Protocol(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InterposerError {
    #[error("failed to bind {addr}: {source}")]
    PortBindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed packet framing: {0}")]
    ProtocolFramingError(String),
    #[error("drain deadline elapsed with connections still open")]
    DrainTimeout,
}
