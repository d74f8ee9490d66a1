//! Errors surfaced by peer host operations.

use thiserror::Error;

/// A failed network operation. The daemon reports the `Display` text to the
/// client that asked for it.
#[derive(Debug, Error)]
pub enum HostError {
    /// No connection to the peer could be established.
    #[error("failed to dial {peer}: {reason}")]
    Dial { peer: String, reason: String },
    /// The operation did not finish before its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),
    /// The remote supports none of the requested protocols.
    #[error("protocol negotiation failed: {0}")]
    Negotiation(String),
    /// A protocol string was rejected before use.
    #[error("invalid protocol id: {0}")]
    InvalidProtocol(String),
    /// DHT requests arrived while the host runs without a DHT.
    #[error("DHT not enabled")]
    DhtDisabled,
    /// The routing table has no peers to start a query from.
    #[error("failed to find any peer in table")]
    NoPeersInTable,
    /// A lookup completed without a result.
    #[error("{0} not found")]
    NotFound(String),
    /// The DHT refused or failed a record or provider operation.
    #[error("DHT operation failed: {0}")]
    Dht(String),
    /// Transport or swarm construction failed.
    #[error("transport error: {0}")]
    Transport(String),
    /// Identity key could not be read or decoded.
    #[error("identity error: {0}")]
    Identity(String),
    /// The network task has stopped.
    #[error("host is shut down")]
    Shutdown,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type HostResult<T> = Result<T, HostError>;
