//! The capability surface the daemon calls into.

use crate::error::HostResult;
use crate::types::{DhtStream, PeerInfo, PeerStream, StreamInfo};
use async_trait::async_trait;
use libp2p::{identity::PublicKey, Multiaddr, PeerId};
use std::sync::Arc;

/// A running peer-to-peer host.
///
/// Implementations must be cheap to share: the daemon holds one
/// `Arc<dyn PeerHost>` and calls it from every connection task concurrently.
#[async_trait]
pub trait PeerHost: Send + Sync + 'static {
    /// The host's peer id and the addresses it advertises.
    fn local_identity(&self) -> (PeerId, Vec<Multiaddr>);

    /// Connect to `peer`, seeding `addrs` as known addresses first.
    ///
    /// Succeeds immediately when a connection already exists.
    async fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> HostResult<()>;

    /// Close every connection to `peer`. Not being connected is not an error.
    async fn disconnect(&self, peer: PeerId) -> HostResult<()>;

    /// Open a stream to `peer` using the first protocol it supports.
    async fn open_stream(
        &self,
        peer: PeerId,
        protocols: &[String],
    ) -> HostResult<(PeerStream, StreamInfo)>;

    /// Route inbound streams for `protocol` to `handler`.
    ///
    /// Registering a protocol again replaces the handler.
    async fn register_inbound_handler(
        &self,
        protocol: &str,
        handler: Arc<dyn InboundHandler>,
    ) -> HostResult<()>;

    /// Snapshot of currently connected peers.
    async fn connected_peers(&self) -> Vec<PeerInfo>;

    /// DHT routing, or `None` when the host runs without a DHT.
    fn dht(&self) -> Option<Arc<dyn DhtRouting>>;

    /// Dial the configured bootstrap peers and start a DHT bootstrap.
    async fn bootstrap(&self) -> HostResult<()>;
}

/// Distributed hash table queries.
///
/// Unary lookups return a single result. Streaming lookups return a
/// [`DhtStream`]; an error before the stream is handed out (such as an empty
/// routing table) is reported through the outer `Result`.
#[async_trait]
pub trait DhtRouting: Send + Sync + 'static {
    async fn find_peer(&self, peer: PeerId) -> HostResult<PeerInfo>;

    /// Peers likely connected to `peer`. Backends without a direct lookup
    /// may approximate this.
    async fn find_peers_connected_to_peer(&self, peer: PeerId) -> HostResult<DhtStream>;

    async fn find_providers(&self, cid: Vec<u8>, count: usize) -> HostResult<DhtStream>;

    async fn get_closest_peers(&self, key: Vec<u8>) -> HostResult<DhtStream>;

    async fn get_public_key(&self, peer: PeerId) -> HostResult<PublicKey>;

    async fn get_value(&self, key: Vec<u8>) -> HostResult<Vec<u8>>;

    async fn search_value(&self, key: Vec<u8>) -> HostResult<DhtStream>;

    async fn put_value(&self, key: Vec<u8>, value: Vec<u8>) -> HostResult<()>;

    async fn provide(&self, cid: Vec<u8>) -> HostResult<()>;
}

/// Receiver of inbound streams for registered protocols.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle_stream(&self, stream: PeerStream, info: StreamInfo);
}
