//! Types shared between the facade and its callers.

use futures::stream::BoxStream;
use libp2p::{Multiaddr, PeerId};
use tokio::io::{AsyncRead, AsyncWrite};

/// A peer id with the addresses it is known under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerInfo {
    pub fn new(peer: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer, addrs }
    }
}

/// Metadata of an open network stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub peer: PeerId,
    /// Remote address of the connection carrying the stream.
    pub addr: Multiaddr,
    /// The negotiated protocol.
    pub protocol: String,
}

/// Byte stream usable with tokio's io utilities.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// An open stream to a remote peer.
pub type PeerStream = Box<dyn AsyncStream>;

/// One result of a streaming DHT query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtValue {
    Peer(PeerInfo),
    PeerId(PeerId),
    Value(Vec<u8>),
}

/// Results of a streaming DHT query, in arrival order.
///
/// Dropping the stream cancels the query.
pub type DhtStream = BoxStream<'static, DhtValue>;
