//! Bidirectional byte relay between two streams.
//!
//! Each direction runs in its own task and copies until EOF or error, then
//! half-closes its destination. The proxy completes once both directions
//! have finished. Both endpoints are owned by the direction tasks, so they
//! are dropped on every exit path, including a panic in either task.

use crate::dispatcher::FramedControl;
use bytes::Bytes;
use p2pd_host::{PeerStream, StreamInfo};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tracing::{debug, warn};

/// Bytes moved in each direction of a finished proxy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    /// From the local side to the network stream.
    pub outbound: u64,
    /// From the network stream to the local side.
    pub inbound: u64,
}

async fn relay<R, W>(mut from: ReadHalf<R>, mut to: WriteHalf<W>, label: &'static str) -> u64
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let copied = match tokio::io::copy(&mut from, &mut to).await {
        Ok(n) => n,
        Err(e) => {
            debug!(direction = label, error = %e, "Relay stopped");
            0
        }
    };
    if let Err(e) = to.shutdown().await {
        debug!(direction = label, error = %e, "Half-close failed");
    }
    copied
}

/// Relay bytes between `local` and `remote` until both directions end.
pub async fn proxy<L, R>(local: L, remote: R) -> ProxyStats
where
    L: AsyncRead + AsyncWrite + Send + 'static,
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let (local_read, local_write) = tokio::io::split(local);
    let (remote_read, remote_write) = tokio::io::split(remote);

    let outbound = tokio::spawn(relay(local_read, remote_write, "outbound"));
    let inbound = tokio::spawn(relay(remote_read, local_write, "inbound"));

    let (outbound, inbound) = tokio::join!(outbound, inbound);
    let mut stats = ProxyStats::default();
    match outbound {
        Ok(n) => stats.outbound = n,
        Err(e) => warn!(error = %e, "Outbound relay task failed"),
    }
    match inbound {
        Ok(n) => stats.inbound = n,
        Err(e) => warn!(error = %e, "Inbound relay task failed"),
    }
    stats
}

/// A control connection that has become a data tunnel.
///
/// Built from the framed connection after a successful STREAM_OPEN. No more
/// control frames are read from it.
pub struct Tunnel {
    client: PeerStream,
    /// Bytes the client sent after the STREAM_OPEN frame, before the switch.
    pending: Bytes,
    stream: PeerStream,
    info: StreamInfo,
}

impl Tunnel {
    /// Take over the connection from its framing layer.
    pub fn from_framed(framed: FramedControl, stream: PeerStream, info: StreamInfo) -> Self {
        let parts = framed.into_parts();
        Self {
            client: parts.io,
            pending: parts.read_buf.freeze(),
            stream,
            info,
        }
    }

    /// Relay until both directions close.
    pub async fn run(self) -> ProxyStats {
        let Self {
            client,
            pending,
            mut stream,
            info,
        } = self;

        let forwarded = match stream.write_all(&pending).await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %info.peer, error = %e, "Failed to forward pipelined bytes");
                false
            }
        };

        let stats = if forwarded {
            let mut stats = proxy(client, stream).await;
            stats.outbound += pending.len() as u64;
            stats
        } else {
            ProxyStats::default()
        };
        debug!(
            peer = %info.peer,
            protocol = %info.protocol,
            outbound = stats.outbound,
            inbound = stats.inbound,
            "Tunnel closed"
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_proxy_relays_both_ways() {
        let (local, mut local_peer) = tokio::io::duplex(64);
        let (remote, mut remote_peer) = tokio::io::duplex(64);
        let proxy = tokio::spawn(proxy(local, remote));

        local_peer.write_all(b"hello remote").await.unwrap();
        let mut buf = [0u8; 12];
        remote_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello remote");

        remote_peer.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        local_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        drop(local_peer);
        drop(remote_peer);
        let stats = proxy.await.unwrap();
        assert_eq!(stats, ProxyStats { outbound: 12, inbound: 2 });
    }

    fn tunnel(client: PeerStream, pending: &'static [u8], stream: PeerStream) -> Tunnel {
        Tunnel {
            client,
            pending: Bytes::from_static(pending),
            stream,
            info: StreamInfo {
                peer: libp2p::PeerId::random(),
                addr: "/ip4/192.0.2.1/tcp/4001".parse().unwrap(),
                protocol: "/echo/1.0.0".into(),
            },
        }
    }

    #[tokio::test]
    async fn test_pipelined_bytes_lead_the_relay() {
        let (client, mut client_peer) = tokio::io::duplex(64);
        let stream = tokio_test::io::Builder::new()
            .write(b"ping")
            .write(b"pong")
            .build();
        let run = tokio::spawn(tunnel(Box::new(client), b"ping", Box::new(stream)).run());

        client_peer.write_all(b"pong").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let stats = run.await.unwrap();
        assert_eq!(stats, ProxyStats { outbound: 8, inbound: 0 });
    }

    #[tokio::test]
    async fn test_failed_pipelined_write_releases_client() {
        let (client, mut client_peer) = tokio::io::duplex(64);
        let stream = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reset"))
            .build();

        let stats = tunnel(Box::new(client), b"ping", Box::new(stream)).run().await;
        assert_eq!(stats, ProxyStats::default());

        // The client connection was dropped with the tunnel.
        let mut buf = Vec::new();
        assert_eq!(client_peer.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_local_close_propagates() {
        let (local, local_peer) = tokio::io::duplex(64);
        let (remote, mut remote_peer) = tokio::io::duplex(64);
        let proxy = tokio::spawn(proxy(local, remote));

        drop(local_peer);
        // Remote sees EOF once the local side is gone.
        let mut buf = Vec::new();
        remote_peer.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        drop(remote_peer);
        proxy.await.unwrap();
    }
}
