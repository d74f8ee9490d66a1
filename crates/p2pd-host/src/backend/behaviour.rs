//! Composed network behaviour of the libp2p backend.

use crate::config::{DhtMode, HostConfig};
use libp2p::connection_limits::{self, ConnectionLimits};
use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{identify, StreamProtocol};
use std::num::NonZeroUsize;

pub(super) const IDENTIFY_PROTOCOL: &str = "/ipfs/id/1.0.0";
pub(super) const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/ipfs/kad/1.0.0");
pub(super) const AGENT_VERSION: &str = "p2pd/0.1";

#[derive(NetworkBehaviour)]
pub(super) struct Behaviour {
    pub(super) identify: identify::Behaviour,
    pub(super) kademlia: Toggle<kad::Behaviour<MemoryStore>>,
    pub(super) stream: libp2p_stream::Behaviour,
    pub(super) limits: connection_limits::Behaviour,
}

impl Behaviour {
    pub(super) fn new(key: &Keypair, config: &HostConfig) -> Self {
        let local_peer_id = key.public().to_peer_id();

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL.to_string(), key.public())
                .with_agent_version(AGENT_VERSION.to_string()),
        );

        let kademlia = match config.dht_mode {
            DhtMode::Off => None,
            mode => {
                let mut kad_config = kad::Config::new(KAD_PROTOCOL);
                kad_config.set_query_timeout(config.kad_query_timeout);
                if let Some(factor) = NonZeroUsize::new(config.kad_replication_factor) {
                    kad_config.set_replication_factor(factor);
                }
                let mut kad = kad::Behaviour::with_config(
                    local_peer_id,
                    MemoryStore::new(local_peer_id),
                    kad_config,
                );
                let kad_mode = match mode {
                    DhtMode::Client => kad::Mode::Client,
                    _ => kad::Mode::Server,
                };
                kad.set_mode(Some(kad_mode));
                Some(kad)
            }
        };

        let limits = match config.conn_limits {
            Some(limits) => {
                ConnectionLimits::default().with_max_established(Some(limits.high))
            }
            None => ConnectionLimits::default(),
        };

        Self {
            identify,
            kademlia: Toggle::from(kademlia),
            stream: libp2p_stream::Behaviour::new(),
            limits: connection_limits::Behaviour::new(limits),
        }
    }
}
