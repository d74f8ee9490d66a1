//! Error types for the daemon.

use p2pd_host::HostError;
use p2pd_wire::{FramingError, ValidationError};
use thiserror::Error;

/// Anything that can go wrong while serving or starting the daemon.
///
/// Request-level failures are reported to the client as an ERROR response
/// carrying the `Display` text; only `Bind` and `Config` stop the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The control connection's byte stream is unusable.
    #[error(transparent)]
    Framing(#[from] FramingError),
    /// A decoded request was malformed or unsupported.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The peer host failed the operation.
    #[error(transparent)]
    Host(#[from] HostError),
    /// A local endpoint could not be reached.
    #[error("failed to connect to local endpoint {addr}: {source}")]
    Resource {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// A multiaddr does not name a usable local endpoint.
    #[error("invalid endpoint address {addr}: {reason}")]
    Endpoint { addr: String, reason: String },
    /// The control endpoint could not be bound.
    #[error("failed to bind control endpoint {addr}: {reason}")]
    Bind { addr: String, reason: String },
    /// Configuration is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DaemonResult<T> = Result<T, DaemonError>;
