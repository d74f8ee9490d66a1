//! Host construction settings.
//!
//! Routing, transport and connection defaults live here and are fixed when
//! the host is built. Nothing downstream branches on them.

use crate::error::{HostError, HostResult};
use libp2p::identity::Keypair;
use libp2p::Multiaddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// How the host participates in the DHT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DhtMode {
    /// No DHT behaviour at all.
    #[default]
    Off,
    /// Issue queries but do not answer them.
    Client,
    /// Full participant.
    Server,
}

/// Connection manager watermarks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnLimits {
    pub low: u32,
    pub high: u32,
    /// How long an idle connection is kept before it may be closed.
    pub grace: Duration,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            low: 256,
            high: 512,
            grace: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Addresses to listen on. Empty means the defaults below.
    pub listen_addrs: Vec<Multiaddr>,
    /// Do not listen at all. Overrides `listen_addrs`.
    pub no_listen: bool,
    /// Addresses advertised instead of the listen addresses.
    pub announce_addrs: Vec<Multiaddr>,
    /// Listen on QUIC in addition to TCP when using default addresses.
    pub quic: bool,
    pub dht_mode: DhtMode,
    /// Peers dialed by `bootstrap()`. Each must end in `/p2p/<peer id>`.
    pub bootstrap_peers: Vec<Multiaddr>,
    pub conn_limits: Option<ConnLimits>,
    pub kad_query_timeout: Duration,
    pub kad_replication_factor: usize,
    pub idle_connection_timeout: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addrs: Vec::new(),
            no_listen: false,
            announce_addrs: Vec::new(),
            quic: false,
            dht_mode: DhtMode::Off,
            bootstrap_peers: Vec::new(),
            conn_limits: None,
            kad_query_timeout: Duration::from_secs(60),
            kad_replication_factor: 20,
            idle_connection_timeout: Duration::from_secs(60),
        }
    }
}

impl HostConfig {
    /// The addresses the host will actually listen on.
    pub fn effective_listen_addrs(&self) -> Vec<Multiaddr> {
        if self.no_listen {
            return Vec::new();
        }
        if !self.listen_addrs.is_empty() {
            return self.listen_addrs.clone();
        }
        let mut addrs = Vec::with_capacity(2);
        if let Ok(tcp) = "/ip4/0.0.0.0/tcp/0".parse() {
            addrs.push(tcp);
        }
        if self.quic {
            if let Ok(quic) = "/ip4/0.0.0.0/udp/0/quic-v1".parse() {
                addrs.push(quic);
            }
        }
        addrs
    }
}

/// Load a protobuf-encoded private key, or generate a fresh Ed25519 key.
pub fn load_identity(path: Option<&Path>) -> HostResult<Keypair> {
    let Some(path) = path else {
        return Ok(Keypair::generate_ed25519());
    };
    let bytes = std::fs::read(path)
        .map_err(|e| HostError::Identity(format!("{}: {e}", path.display())))?;
    let keypair = Keypair::from_protobuf_encoding(&bytes)
        .map_err(|e| HostError::Identity(format!("{}: {e}", path.display())))?;
    info!(path = %path.display(), "Loaded identity key");
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_listen_addrs() {
        let config = HostConfig::default();
        let addrs = config.effective_listen_addrs();
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].to_string(), "/ip4/0.0.0.0/tcp/0");

        let config = HostConfig {
            quic: true,
            ..Default::default()
        };
        let addrs = config.effective_listen_addrs();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[1].to_string(), "/ip4/0.0.0.0/udp/0/quic-v1");
    }

    #[test]
    fn test_no_listen_wins() {
        let config = HostConfig {
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
            no_listen: true,
            ..Default::default()
        };
        assert!(config.effective_listen_addrs().is_empty());
    }

    #[test]
    fn test_identity_roundtrip_through_file() {
        let keypair = Keypair::generate_ed25519();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, keypair.to_protobuf_encoding().unwrap()).unwrap();

        let loaded = load_identity(Some(&path)).unwrap();
        assert_eq!(loaded.public().to_peer_id(), keypair.public().to_peer_id());
    }

    #[test]
    fn test_identity_garbage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.key");
        std::fs::write(&path, b"not a key").unwrap();
        assert!(matches!(
            load_identity(Some(&path)),
            Err(HostError::Identity(_))
        ));
    }
}
