//! Handler registry: which local endpoint serves which protocol.
//!
//! STREAM_HANDLER requests write it; the [`InboundRouter`] reads it each
//! time the host hands over an inbound stream. Every mutation is a single
//! map insert, so the last registration for a protocol wins.

use crate::endpoint::Endpoint;
use crate::error::DaemonResult;
use crate::proxy::proxy;
use async_trait::async_trait;
use dashmap::DashMap;
use p2pd_host::{InboundHandler, PeerStream, StreamInfo};
use p2pd_wire::encode_frame;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Concurrent protocol → endpoint map.
#[derive(Debug, Clone, Default)]
pub struct HandlerRegistry {
    handlers: Arc<DashMap<String, Endpoint>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `protocol` to `endpoint`, replacing any previous entry.
    pub fn register(&self, protocol: &str, endpoint: Endpoint) -> Option<Endpoint> {
        self.handlers.insert(protocol.to_string(), endpoint)
    }

    pub fn lookup(&self, protocol: &str) -> Option<Endpoint> {
        self.handlers.get(protocol).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Bridges inbound network streams to registered local endpoints.
pub struct InboundRouter {
    registry: HandlerRegistry,
}

impl InboundRouter {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    /// Connect to the endpoint and announce the stream with a
    /// length-delimited StreamInfo header.
    async fn open_local(endpoint: &Endpoint, info: &StreamInfo) -> DaemonResult<PeerStream> {
        let mut local = endpoint.connect().await?;
        let header = p2pd_wire::StreamInfo::new(&info.peer, &info.addr, info.protocol.clone());
        local.write_all(&encode_frame(&header)).await?;
        Ok(local)
    }
}

#[async_trait]
impl InboundHandler for InboundRouter {
    async fn handle_stream(&self, mut stream: PeerStream, info: StreamInfo) {
        let Some(endpoint) = self.registry.lookup(&info.protocol) else {
            warn!(
                peer = %info.peer,
                protocol = %info.protocol,
                "Inbound stream for unregistered protocol"
            );
            let _ = stream.shutdown().await;
            return;
        };

        let local = match Self::open_local(&endpoint, &info).await {
            Ok(local) => local,
            Err(e) => {
                warn!(
                    peer = %info.peer,
                    protocol = %info.protocol,
                    error = %e,
                    "Dropping inbound stream"
                );
                let _ = stream.shutdown().await;
                return;
            }
        };

        debug!(peer = %info.peer, protocol = %info.protocol, endpoint = %endpoint, "Bridging inbound stream");
        let stats = proxy(local, stream).await;
        info!(
            peer = %info.peer,
            protocol = %info.protocol,
            to_handler = stats.outbound,
            to_peer = stats.inbound,
            "Inbound stream closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use libp2p::PeerId;
    use p2pd_wire::ControlCodec;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use tokio_util::codec::FramedRead;

    fn stream_info(protocol: &str) -> StreamInfo {
        StreamInfo {
            peer: PeerId::random(),
            addr: "/ip4/198.51.100.4/tcp/4001".parse().unwrap(),
            protocol: protocol.to_string(),
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        let endpoint: Endpoint = "/ip4/127.0.0.1/tcp/7000".parse().unwrap();
        assert!(registry.register("/echo/1.0.0", endpoint.clone()).is_none());
        assert_eq!(registry.lookup("/echo/1.0.0"), Some(endpoint));
        assert_eq!(registry.lookup("/other/1.0.0"), None);
    }

    #[test]
    fn test_last_registration_wins() {
        let registry = HandlerRegistry::new();
        let first: Endpoint = "/ip4/127.0.0.1/tcp/7000".parse().unwrap();
        let second: Endpoint = "/unix/tmp/second.sock".parse().unwrap();
        registry.register("/echo/1.0.0", first.clone());
        assert_eq!(registry.register("/echo/1.0.0", second.clone()), Some(first));
        assert_eq!(registry.lookup("/echo/1.0.0"), Some(second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_clones_share_entries() {
        let registry = HandlerRegistry::new();
        let clone = registry.clone();
        clone.register("/echo/1.0.0", "/unix/tmp/a.sock".parse().unwrap());
        assert!(registry.lookup("/echo/1.0.0").is_some());
    }

    #[tokio::test]
    async fn test_unregistered_protocol_closes_stream() {
        let router = InboundRouter::new(HandlerRegistry::new());
        let (stream, mut peer) = tokio::io::duplex(64);
        router
            .handle_stream(Box::new(stream), stream_info("/nobody/1.0.0"))
            .await;

        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_closes_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let registry = HandlerRegistry::new();
        registry.register("/echo/1.0.0", Endpoint::Tcp(addr));
        let router = InboundRouter::new(registry);

        let (stream, mut peer) = tokio::io::duplex(64);
        router
            .handle_stream(Box::new(stream), stream_info("/echo/1.0.0"))
            .await;
        let mut buf = Vec::new();
        peer.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_header_then_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = HandlerRegistry::new();
        registry.register("/echo/1.0.0", Endpoint::Tcp(listener.local_addr().unwrap()));
        let router = Arc::new(InboundRouter::new(registry));

        let info = stream_info("/echo/1.0.0");
        let (stream, mut peer) = tokio::io::duplex(256);
        let handler = {
            let router = router.clone();
            let info = info.clone();
            tokio::spawn(async move { router.handle_stream(Box::new(stream), info).await })
        };

        let (local, _) = listener.accept().await.unwrap();
        peer.write_all(b"payload").await.unwrap();
        peer.shutdown().await.unwrap();

        let mut framed = FramedRead::new(local, ControlCodec::<p2pd_wire::StreamInfo>::default());
        let header = framed.next().await.unwrap().unwrap();
        assert_eq!(PeerId::from_bytes(&header.peer).unwrap(), info.peer);
        assert_eq!(header.proto, "/echo/1.0.0");

        let mut rest = framed.read_buffer().to_vec();
        let mut local = framed.into_inner();
        local.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"payload");

        drop(local);
        drop(peer);
        handler.await.unwrap();
    }
}
