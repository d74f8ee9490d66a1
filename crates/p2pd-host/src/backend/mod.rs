//! libp2p backend for the peer host facade.
//!
//! [`Libp2pHost::spawn`] builds a swarm (TCP, QUIC, DNS, Noise, Yamux) with
//! identify, optional Kademlia, raw streams and connection limits, starts
//! listening, and moves the swarm into its own task. Stream opening and
//! inbound acceptance go through a `libp2p_stream::Control` and never touch
//! the swarm task.

mod behaviour;
mod task;

use crate::config::{ConnLimits, DhtMode, HostConfig};
use crate::error::{HostError, HostResult};
use crate::facade::{DhtRouting, InboundHandler, PeerHost};
use crate::types::{DhtStream, DhtValue, PeerInfo, PeerStream, StreamInfo};
use async_trait::async_trait;
use behaviour::Behaviour;
use dashmap::DashMap;
use futures::StreamExt;
use libp2p::identity::{Keypair, PublicKey};
use libp2p::swarm::ConnectionId;
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId, StreamProtocol};
use libp2p_stream::OpenStreamError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use task::{Command, DhtCommand, SwarmTask};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::{debug, info, warn};

/// Capacity of the facade → swarm task command channel.
const COMMAND_BUFFER: usize = 256;

/// State read by facade calls without a round trip through the swarm task.
pub(crate) struct Shared {
    local_peer_id: PeerId,
    announce_addrs: Vec<Multiaddr>,
    listen_addrs: RwLock<Vec<Multiaddr>>,
    /// Remote address of every live connection, per peer.
    connections: RwLock<HashMap<PeerId, Vec<(ConnectionId, Multiaddr)>>>,
}

impl Shared {
    fn connection_opened(&self, peer: PeerId, id: ConnectionId, addr: Multiaddr) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.entry(peer).or_default().push((id, addr));
    }

    fn connection_closed(&self, peer: &PeerId, id: ConnectionId) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = connections.get_mut(peer) {
            list.retain(|(conn, _)| *conn != id);
            if list.is_empty() {
                connections.remove(peer);
            }
        }
    }

    fn connection_addrs(&self, peer: &PeerId) -> Vec<Multiaddr> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        let mut addrs: Vec<Multiaddr> = connections
            .get(peer)
            .map(|list| list.iter().map(|(_, addr)| addr.clone()).collect())
            .unwrap_or_default();
        addrs.dedup();
        addrs
    }

    fn advertised_addrs(&self) -> Vec<Multiaddr> {
        if !self.announce_addrs.is_empty() {
            return self.announce_addrs.clone();
        }
        self.listen_addrs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// A running libp2p host.
pub struct Libp2pHost {
    shared: Arc<Shared>,
    commands: mpsc::Sender<Command>,
    control: libp2p_stream::Control,
    handlers: Arc<DashMap<String, Arc<dyn InboundHandler>>>,
    dht: Option<Arc<Libp2pDht>>,
    bootstrap_peers: Vec<Multiaddr>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Libp2pHost {
    /// Build the swarm, start listening and spawn the network task.
    pub async fn spawn(keypair: Keypair, config: HostConfig) -> HostResult<Self> {
        let local_peer_id = keypair.public().to_peer_id();
        let idle_timeout = config
            .conn_limits
            .map(|ConnLimits { grace, .. }| grace)
            .unwrap_or(config.idle_connection_timeout);

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| HostError::Transport(e.to_string()))?
            .with_quic()
            .with_dns()
            .map_err(|e| HostError::Transport(e.to_string()))?
            .with_behaviour(|key| Behaviour::new(key, &config))
            .map_err(|e| HostError::Transport(e.to_string()))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(idle_timeout))
            .build();

        for addr in &config.announce_addrs {
            swarm.add_external_address(addr.clone());
        }

        let control = swarm.behaviour().stream.new_control();
        let shared = Arc::new(Shared {
            local_peer_id,
            announce_addrs: config.announce_addrs.clone(),
            listen_addrs: RwLock::new(Vec::new()),
            connections: RwLock::new(HashMap::new()),
        });

        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let mut task = SwarmTask::new(swarm, command_rx, shared.clone());
        task.listen(&config.effective_listen_addrs()).await?;
        let task = tokio::spawn(task.run());

        let dht = (config.dht_mode != DhtMode::Off).then(|| {
            Arc::new(Libp2pDht {
                commands: commands.clone(),
            })
        });

        info!(
            peer_id = %local_peer_id,
            dht = ?config.dht_mode,
            "Peer host started"
        );

        Ok(Self {
            shared,
            commands,
            control,
            handlers: Arc::new(DashMap::new()),
            dht,
            bootstrap_peers: config.bootstrap_peers,
            task: Mutex::new(Some(task)),
        })
    }

    /// Stop the network task. Open streams are dropped with it.
    ///
    /// Later calls return immediately; facade calls made afterwards fail
    /// with [`HostError::Shutdown`].
    pub async fn shutdown(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some(task) = task else {
            return;
        };
        let _ = self.commands.send(Command::Shutdown).await;
        if let Err(e) = task.await {
            warn!(error = %e, "Swarm task ended abnormally");
        }
    }

    /// Spawn the accept loop for a newly registered protocol.
    fn accept_protocol(&self, protocol: StreamProtocol) -> HostResult<()> {
        let mut incoming = self
            .control
            .clone()
            .accept(protocol.clone())
            .map_err(|e| HostError::InvalidProtocol(format!("{protocol}: {e}")))?;
        let handlers = self.handlers.clone();
        let shared = self.shared.clone();

        tokio::spawn(async move {
            while let Some((peer, stream)) = incoming.next().await {
                let key = protocol.to_string();
                let Some(handler) = handlers.get(&key).map(|h| h.value().clone()) else {
                    debug!(protocol = %key, "No handler for inbound stream");
                    continue;
                };
                let addr = shared
                    .connection_addrs(&peer)
                    .into_iter()
                    .next()
                    .unwrap_or_else(Multiaddr::empty);
                let info = StreamInfo {
                    peer,
                    addr,
                    protocol: key,
                };
                debug!(peer = %peer, protocol = %info.protocol, "Inbound stream");
                tokio::spawn(async move {
                    handler.handle_stream(Box::new(stream.compat()), info).await;
                });
            }
        });
        Ok(())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<HostResult<T>>) -> Command,
    ) -> HostResult<T> {
        send_command(&self.commands, build).await
    }
}

async fn send_command<T>(
    commands: &mpsc::Sender<Command>,
    build: impl FnOnce(oneshot::Sender<HostResult<T>>) -> Command,
) -> HostResult<T> {
    let (tx, rx) = oneshot::channel();
    commands
        .send(build(tx))
        .await
        .map_err(|_| HostError::Shutdown)?;
    rx.await.map_err(|_| HostError::Shutdown)?
}

fn parse_protocol(protocol: &str) -> HostResult<StreamProtocol> {
    StreamProtocol::try_from_owned(protocol.to_string())
        .map_err(|e| HostError::InvalidProtocol(format!("{protocol}: {e}")))
}

#[async_trait]
impl PeerHost for Libp2pHost {
    fn local_identity(&self) -> (PeerId, Vec<Multiaddr>) {
        (self.shared.local_peer_id, self.shared.advertised_addrs())
    }

    async fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> HostResult<()> {
        self.request(|reply| Command::Dial { peer, addrs, reply })
            .await
    }

    async fn disconnect(&self, peer: PeerId) -> HostResult<()> {
        self.request(|reply| Command::Disconnect { peer, reply })
            .await
    }

    async fn open_stream(
        &self,
        peer: PeerId,
        protocols: &[String],
    ) -> HostResult<(PeerStream, StreamInfo)> {
        let mut control = self.control.clone();
        let mut unsupported = Vec::new();
        for protocol in protocols {
            let proto = parse_protocol(protocol)?;
            match control.open_stream(peer, proto).await {
                Ok(stream) => {
                    let addr = self
                        .shared
                        .connection_addrs(&peer)
                        .into_iter()
                        .next()
                        .unwrap_or_else(Multiaddr::empty);
                    let info = StreamInfo {
                        peer,
                        addr,
                        protocol: protocol.clone(),
                    };
                    return Ok((Box::new(stream.compat()), info));
                }
                Err(OpenStreamError::UnsupportedProtocol(_)) => unsupported.push(protocol.as_str()),
                Err(OpenStreamError::Io(e)) => return Err(HostError::Io(e)),
                Err(e) => {
                    return Err(HostError::Dial {
                        peer: peer.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
        }
        Err(HostError::Negotiation(format!(
            "peer {peer} supports none of [{}]",
            unsupported.join(", ")
        )))
    }

    async fn register_inbound_handler(
        &self,
        protocol: &str,
        handler: Arc<dyn InboundHandler>,
    ) -> HostResult<()> {
        let proto = parse_protocol(protocol)?;
        if self
            .handlers
            .insert(protocol.to_string(), handler)
            .is_none()
        {
            self.accept_protocol(proto)?;
        }
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<PeerInfo> {
        let connections = self
            .shared
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner());
        connections
            .iter()
            .map(|(peer, conns)| {
                PeerInfo::new(*peer, conns.iter().map(|(_, addr)| addr.clone()).collect())
            })
            .collect()
    }

    fn dht(&self) -> Option<Arc<dyn DhtRouting>> {
        self.dht
            .clone()
            .map(|dht| dht as Arc<dyn DhtRouting>)
    }

    async fn bootstrap(&self) -> HostResult<()> {
        let peers = self.bootstrap_peers.clone();
        self.request(|reply| Command::Bootstrap { peers, reply })
            .await
    }
}

/// DHT handle backed by the swarm task's Kademlia behaviour.
struct Libp2pDht {
    commands: mpsc::Sender<Command>,
}

impl Libp2pDht {
    async fn query<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<HostResult<T>>) -> DhtCommand,
    ) -> HostResult<T> {
        send_command(&self.commands, |reply| Command::Dht(build(reply))).await
    }

    async fn stream(
        &self,
        build: impl FnOnce(
            oneshot::Sender<HostResult<mpsc::UnboundedReceiver<DhtValue>>>,
        ) -> DhtCommand,
    ) -> HostResult<DhtStream> {
        let rx = self.query(build).await?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        })
        .boxed())
    }
}

#[async_trait]
impl DhtRouting for Libp2pDht {
    async fn find_peer(&self, peer: PeerId) -> HostResult<PeerInfo> {
        self.query(|reply| DhtCommand::FindPeer { peer, reply })
            .await
    }

    /// Approximated by a closest-peers walk toward `peer`'s key.
    ///
    /// Kademlia cannot ask which peers hold a connection to `peer`. The peers
    /// nearest to it in key space are the ones most likely to, so those are
    /// streamed, each with its known addresses.
    async fn find_peers_connected_to_peer(&self, peer: PeerId) -> HostResult<DhtStream> {
        self.stream(|reply| DhtCommand::ClosestPeers {
            key: peer.to_bytes(),
            with_addrs: true,
            reply,
        })
        .await
    }

    async fn find_providers(&self, cid: Vec<u8>, count: usize) -> HostResult<DhtStream> {
        self.stream(|reply| DhtCommand::Providers { cid, count, reply })
            .await
    }

    async fn get_closest_peers(&self, key: Vec<u8>) -> HostResult<DhtStream> {
        self.stream(|reply| DhtCommand::ClosestPeers {
            key,
            with_addrs: false,
            reply,
        })
        .await
    }

    async fn get_public_key(&self, peer: PeerId) -> HostResult<PublicKey> {
        self.query(|reply| DhtCommand::PublicKey { peer, reply })
            .await
    }

    async fn get_value(&self, key: Vec<u8>) -> HostResult<Vec<u8>> {
        self.query(|reply| DhtCommand::GetValue { key, reply })
            .await
    }

    async fn search_value(&self, key: Vec<u8>) -> HostResult<DhtStream> {
        self.stream(|reply| DhtCommand::SearchValue { key, reply })
            .await
    }

    async fn put_value(&self, key: Vec<u8>, value: Vec<u8>) -> HostResult<()> {
        self.query(|reply| DhtCommand::PutValue { key, value, reply })
            .await
    }

    async fn provide(&self, cid: Vec<u8>) -> HostResult<()> {
        self.query(|reply| DhtCommand::Provide { cid, reply })
            .await
    }
}
