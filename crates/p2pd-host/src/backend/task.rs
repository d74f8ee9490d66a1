//! The swarm task.
//!
//! One task owns the `Swarm`. Facade calls reach it as [`Command`]s over an
//! mpsc channel and receive their answers on oneshot channels. DHT queries
//! are tracked by `QueryId` until the final progress step.
//!
//! Streaming queries push results into an unbounded channel per query. A
//! query's result set is finite (capped by `count` for providers, by the
//! replication factor for closest peers, by the peers contacted for record
//! searches), so the swarm task never waits on a slow reader and never
//! drops a result.

use super::behaviour::{Behaviour, BehaviourEvent};
use super::Shared;
use crate::error::{HostError, HostResult};
use crate::types::{DhtValue, PeerInfo};
use futures::StreamExt;
use libp2p::core::transport::ListenerId;
use libp2p::identity::PublicKey;
use libp2p::kad::{self, GetClosestPeersError, GetProvidersOk, GetRecordOk, QueryId, QueryResult};
use libp2p::multiaddr::Protocol;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{DialError, SwarmEvent};
use libp2p::{identify, Multiaddr, PeerId, Swarm};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long startup waits for listeners to report their addresses.
const LISTEN_WAIT: Duration = Duration::from_secs(5);

pub(super) type Reply<T> = oneshot::Sender<HostResult<T>>;

pub(super) enum Command {
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        reply: Reply<()>,
    },
    Disconnect {
        peer: PeerId,
        reply: Reply<()>,
    },
    Bootstrap {
        peers: Vec<Multiaddr>,
        reply: Reply<()>,
    },
    Dht(DhtCommand),
    Shutdown,
}

pub(super) enum DhtCommand {
    FindPeer {
        peer: PeerId,
        reply: Reply<PeerInfo>,
    },
    /// Closest peers to `key`, emitted as full peer infos or bare ids.
    ClosestPeers {
        key: Vec<u8>,
        with_addrs: bool,
        reply: Reply<mpsc::UnboundedReceiver<DhtValue>>,
    },
    Providers {
        cid: Vec<u8>,
        count: usize,
        reply: Reply<mpsc::UnboundedReceiver<DhtValue>>,
    },
    SearchValue {
        key: Vec<u8>,
        reply: Reply<mpsc::UnboundedReceiver<DhtValue>>,
    },
    GetValue {
        key: Vec<u8>,
        reply: Reply<Vec<u8>>,
    },
    PutValue {
        key: Vec<u8>,
        value: Vec<u8>,
        reply: Reply<()>,
    },
    Provide {
        cid: Vec<u8>,
        reply: Reply<()>,
    },
    PublicKey {
        peer: PeerId,
        reply: Reply<PublicKey>,
    },
}

/// A DHT query waiting on progress events.
enum PendingQuery {
    FindPeer {
        target: PeerId,
        reply: Reply<PeerInfo>,
    },
    ClosestPeers {
        with_addrs: bool,
        tx: mpsc::UnboundedSender<DhtValue>,
    },
    Providers {
        remaining: usize,
        seen: HashSet<PeerId>,
        tx: mpsc::UnboundedSender<DhtValue>,
    },
    SearchValue {
        tx: mpsc::UnboundedSender<DhtValue>,
    },
    GetValue {
        reply: Reply<Vec<u8>>,
    },
    PublicKey {
        peer: PeerId,
        reply: Reply<PublicKey>,
    },
    Write {
        what: &'static str,
        reply: Reply<()>,
    },
    Bootstrap,
}

impl PendingQuery {
    /// Whether the receiving side is gone and the query can be stopped.
    fn abandoned(&self) -> bool {
        match self {
            Self::ClosestPeers { tx, .. } | Self::Providers { tx, .. } | Self::SearchValue { tx } => {
                tx.is_closed()
            }
            Self::FindPeer { reply, .. } => reply.is_closed(),
            Self::GetValue { reply } => reply.is_closed(),
            Self::PublicKey { reply, .. } => reply.is_closed(),
            Self::Write { reply, .. } => reply.is_closed(),
            Self::Bootstrap => false,
        }
    }

    /// Close out a query that ended without answering.
    fn finish(self) {
        match self {
            Self::FindPeer { target, reply } => {
                let _ = reply.send(Err(HostError::NotFound(format!("peer {target}"))));
            }
            Self::GetValue { reply } => {
                let _ = reply.send(Err(HostError::NotFound("value".into())));
            }
            Self::PublicKey { peer, reply } => {
                let _ = reply.send(Err(HostError::NotFound(format!("public key of {peer}"))));
            }
            Self::Write { what, reply } => {
                let _ = reply.send(Err(HostError::Dht(format!("{what} ended without result"))));
            }
            // Dropping the sender ends the result stream.
            Self::ClosestPeers { .. }
            | Self::Providers { .. }
            | Self::SearchValue { .. }
            | Self::Bootstrap => {}
        }
    }
}

pub(super) struct SwarmTask {
    swarm: Swarm<Behaviour>,
    commands: mpsc::Receiver<Command>,
    shared: Arc<Shared>,
    pending_dials: HashMap<PeerId, Vec<Reply<()>>>,
    queries: HashMap<QueryId, PendingQuery>,
    /// Public keys learned through identify.
    public_keys: HashMap<PeerId, PublicKey>,
}

impl SwarmTask {
    pub(super) fn new(
        swarm: Swarm<Behaviour>,
        commands: mpsc::Receiver<Command>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            swarm,
            commands,
            shared,
            pending_dials: HashMap::new(),
            queries: HashMap::new(),
            public_keys: HashMap::new(),
        }
    }

    /// Start listening and wait until every listener reported an address.
    pub(super) async fn listen(&mut self, addrs: &[Multiaddr]) -> HostResult<()> {
        let mut waiting = HashSet::<ListenerId>::new();
        for addr in addrs {
            let id = self
                .swarm
                .listen_on(addr.clone())
                .map_err(|e| HostError::Transport(format!("cannot listen on {addr}: {e}")))?;
            waiting.insert(id);
        }

        let wait = async {
            while !waiting.is_empty() {
                match self.swarm.select_next_some().await {
                    SwarmEvent::NewListenAddr {
                        listener_id,
                        address,
                    } => {
                        waiting.remove(&listener_id);
                        self.on_new_listen_addr(address);
                    }
                    SwarmEvent::ListenerClosed {
                        listener_id,
                        reason: Err(e),
                        ..
                    }
                    | SwarmEvent::ListenerError {
                        listener_id,
                        error: e,
                    } if waiting.contains(&listener_id) => {
                        return Err(HostError::Transport(format!("listener failed: {e}")));
                    }
                    other => self.on_swarm_event(other),
                }
            }
            Ok(())
        };
        match tokio::time::timeout(LISTEN_WAIT, wait).await {
            Ok(result) => result,
            Err(_) => Err(HostError::Timeout("listening")),
        }
    }

    pub(super) async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                event = self.swarm.select_next_some() => self.on_swarm_event(event),
            }
        }
        info!("Swarm task stopped");
    }

    fn kad(&mut self) -> Option<&mut kad::Behaviour<kad::store::MemoryStore>> {
        self.swarm.behaviour_mut().kademlia.as_mut()
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Dial { peer, addrs, reply } => self.dial(peer, addrs, reply),
            Command::Disconnect { peer, reply } => {
                // Err means there was no connection, which is fine.
                let _ = self.swarm.disconnect_peer_id(peer);
                let _ = reply.send(Ok(()));
            }
            Command::Bootstrap { peers, reply } => {
                let _ = reply.send(self.bootstrap(peers));
            }
            Command::Dht(command) => self.on_dht_command(command),
            Command::Shutdown => {}
        }
    }

    fn dial(&mut self, peer: PeerId, addrs: Vec<Multiaddr>, reply: Reply<()>) {
        if self.swarm.is_connected(&peer) {
            let _ = reply.send(Ok(()));
            return;
        }
        for addr in &addrs {
            self.swarm.add_peer_address(peer, addr.clone());
            if let Some(kad) = self.kad() {
                kad.add_address(&peer, addr.clone());
            }
        }
        match self.swarm.dial(DialOpts::peer_id(peer).addresses(addrs).build()) {
            Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                self.pending_dials.entry(peer).or_default().push(reply);
            }
            Err(e) => {
                let _ = reply.send(Err(HostError::Dial {
                    peer: peer.to_string(),
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn bootstrap(&mut self, peers: Vec<Multiaddr>) -> HostResult<()> {
        let mut dialed = 0usize;
        for addr in peers {
            let Some(Protocol::P2p(peer)) = addr.iter().last() else {
                warn!(addr = %addr, "Bootstrap address has no /p2p/ component, skipping");
                continue;
            };
            if let Some(kad) = self.kad() {
                kad.add_address(&peer, addr.clone());
            }
            match self.swarm.dial(addr.clone()) {
                Ok(()) => dialed += 1,
                Err(e) => warn!(addr = %addr, error = %e, "Bootstrap dial failed"),
            }
        }
        info!(dialed, "Bootstrap peers dialed");

        if let Some(kad) = self.kad() {
            match kad.bootstrap() {
                Ok(id) => {
                    self.queries.insert(id, PendingQuery::Bootstrap);
                }
                Err(_) => return Err(HostError::NoPeersInTable),
            }
        }
        Ok(())
    }

    fn routing_table_is_empty(&mut self) -> bool {
        match self.kad() {
            Some(kad) => kad.kbuckets().map(|b| b.num_entries()).sum::<usize>() == 0,
            None => true,
        }
    }

    fn on_dht_command(&mut self, command: DhtCommand) {
        // The backend hands out a DHT handle only when kademlia is enabled.
        if self.kad().is_none() {
            fail_dht_command(command, HostError::DhtDisabled);
            return;
        }

        // Answers that need no network round trip.
        let command = match command {
            DhtCommand::FindPeer { peer, reply } if self.swarm.is_connected(&peer) => {
                let addrs = self.shared.connection_addrs(&peer);
                let _ = reply.send(Ok(PeerInfo::new(peer, addrs)));
                return;
            }
            DhtCommand::PublicKey { peer, reply } => {
                if let Some(key) = self
                    .public_keys
                    .get(&peer)
                    .cloned()
                    .or_else(|| embedded_public_key(&peer))
                {
                    let _ = reply.send(Ok(key));
                    return;
                }
                DhtCommand::PublicKey { peer, reply }
            }
            other => other,
        };

        if self.routing_table_is_empty() {
            fail_dht_command(command, HostError::NoPeersInTable);
            return;
        }

        let Some(kad) = self.swarm.behaviour_mut().kademlia.as_mut() else {
            return;
        };
        let (id, pending) = match command {
            DhtCommand::FindPeer { peer, reply } => (
                kad.get_closest_peers(peer),
                PendingQuery::FindPeer {
                    target: peer,
                    reply,
                },
            ),
            DhtCommand::ClosestPeers {
                key,
                with_addrs,
                reply,
            } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let id = kad.get_closest_peers(key);
                let _ = reply.send(Ok(rx));
                (id, PendingQuery::ClosestPeers { with_addrs, tx })
            }
            DhtCommand::Providers { cid, count, reply } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let id = kad.get_providers(kad::RecordKey::new(&cid));
                let _ = reply.send(Ok(rx));
                (
                    id,
                    PendingQuery::Providers {
                        remaining: count,
                        seen: HashSet::new(),
                        tx,
                    },
                )
            }
            DhtCommand::SearchValue { key, reply } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let id = kad.get_record(kad::RecordKey::new(&key));
                let _ = reply.send(Ok(rx));
                (id, PendingQuery::SearchValue { tx })
            }
            DhtCommand::GetValue { key, reply } => (
                kad.get_record(kad::RecordKey::new(&key)),
                PendingQuery::GetValue { reply },
            ),
            DhtCommand::PublicKey { peer, reply } => (
                kad.get_record(kad::RecordKey::new(&public_key_record(&peer))),
                PendingQuery::PublicKey { peer, reply },
            ),
            DhtCommand::PutValue { key, value, reply } => {
                let record = kad::Record::new(kad::RecordKey::new(&key), value);
                match kad.put_record(record, kad::Quorum::One) {
                    Ok(id) => (
                        id,
                        PendingQuery::Write {
                            what: "put value",
                            reply,
                        },
                    ),
                    Err(e) => {
                        let _ = reply.send(Err(HostError::Dht(e.to_string())));
                        return;
                    }
                }
            }
            DhtCommand::Provide { cid, reply } => {
                match kad.start_providing(kad::RecordKey::new(&cid)) {
                    Ok(id) => (
                        id,
                        PendingQuery::Write {
                            what: "provide",
                            reply,
                        },
                    ),
                    Err(e) => {
                        let _ = reply.send(Err(HostError::Dht(e.to_string())));
                        return;
                    }
                }
            }
        };
        self.queries.insert(id, pending);
    }

    fn on_swarm_event(&mut self, event: SwarmEvent<BehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(addr = %address, "Listening");
                self.on_new_listen_addr(address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                let mut addrs = self
                    .shared
                    .listen_addrs
                    .write()
                    .unwrap_or_else(|e| e.into_inner());
                addrs.retain(|a| a != &address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                debug!(peer = %peer_id, addr = %endpoint.get_remote_address(), "Connection established");
                self.shared.connection_opened(
                    peer_id,
                    connection_id,
                    endpoint.get_remote_address().clone(),
                );
                for reply in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = reply.send(Ok(()));
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                ..
            } => {
                debug!(peer = %peer_id, "Connection closed");
                self.shared.connection_closed(&peer_id, connection_id);
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer),
                error,
                ..
            } => {
                debug!(peer = %peer, error = %error, "Dial failed");
                if self.swarm.is_connected(&peer) {
                    return;
                }
                let reason = error.to_string();
                for reply in self.pending_dials.remove(&peer).unwrap_or_default() {
                    let _ = reply.send(Err(HostError::Dial {
                        peer: peer.to_string(),
                        reason: reason.clone(),
                    }));
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                debug!(peer = %peer_id, agent = %info.agent_version, "Identified peer");
                self.public_keys.insert(peer_id, info.public_key);
                if let Some(kad) = self.kad() {
                    for addr in info.listen_addrs {
                        kad.add_address(&peer_id, addr);
                    }
                }
            }
            SwarmEvent::Behaviour(BehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result,
                step,
                ..
            })) => self.on_query_progress(id, result, step.last),
            _ => {}
        }
    }

    fn on_new_listen_addr(&mut self, address: Multiaddr) {
        let mut addrs = self
            .shared
            .listen_addrs
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if !addrs.contains(&address) {
            addrs.push(address);
        }
    }

    fn on_query_progress(&mut self, id: QueryId, result: QueryResult, last: bool) {
        let Some(pending) = self.queries.remove(&id) else {
            return;
        };
        let pending = match apply_progress(&self.shared, pending, result) {
            Some(pending) if pending.abandoned() => {
                debug!(?id, "DHT query abandoned by reader");
                if let Some(mut query) = self.kad().and_then(|kad| kad.query_mut(&id)) {
                    query.finish();
                }
                return;
            }
            Some(pending) => pending,
            None => {
                if !last {
                    if let Some(mut query) = self.kad().and_then(|kad| kad.query_mut(&id)) {
                        query.finish();
                    }
                }
                return;
            }
        };
        if last {
            pending.finish();
        } else {
            self.queries.insert(id, pending);
        }
    }
}

/// Feed one progress result into a query.
///
/// Returns the query when it still expects results, `None` once it has
/// answered.
fn apply_progress(
    shared: &Shared,
    pending: PendingQuery,
    result: QueryResult,
) -> Option<PendingQuery> {
    match (pending, result) {
        (PendingQuery::FindPeer { target, reply }, QueryResult::GetClosestPeers(result)) => {
            let peers = match result {
                Ok(ok) => ok.peers,
                Err(GetClosestPeersError::Timeout { peers, .. }) => peers,
            };
            match peers.into_iter().find(|p| p.peer_id == target) {
                Some(found) => {
                    let _ = reply.send(Ok(PeerInfo::new(found.peer_id, found.addrs)));
                    None
                }
                None => Some(PendingQuery::FindPeer { target, reply }),
            }
        }
        (PendingQuery::ClosestPeers { with_addrs, tx }, QueryResult::GetClosestPeers(result)) => {
            let peers = match result {
                Ok(ok) => ok.peers,
                Err(GetClosestPeersError::Timeout { peers, .. }) => peers,
            };
            for peer in peers {
                let value = if with_addrs {
                    DhtValue::Peer(PeerInfo::new(peer.peer_id, peer.addrs))
                } else {
                    DhtValue::PeerId(peer.peer_id)
                };
                if tx.send(value).is_err() {
                    break;
                }
            }
            Some(PendingQuery::ClosestPeers { with_addrs, tx })
        }
        (
            PendingQuery::Providers {
                mut remaining,
                mut seen,
                tx,
            },
            QueryResult::GetProviders(result),
        ) => {
            let providers = match result {
                Ok(GetProvidersOk::FoundProviders { providers, .. }) => providers,
                Ok(_) => HashSet::new(),
                Err(e) => {
                    debug!(error = %e, "Provider lookup ended");
                    HashSet::new()
                }
            };
            for provider in providers {
                if remaining == 0 {
                    break;
                }
                if seen.contains(&provider) {
                    continue;
                }
                let info = PeerInfo::new(provider, shared.connection_addrs(&provider));
                if tx.send(DhtValue::Peer(info)).is_err() {
                    break;
                }
                seen.insert(provider);
                remaining -= 1;
            }
            (remaining > 0).then_some(PendingQuery::Providers {
                remaining,
                seen,
                tx,
            })
        }
        (PendingQuery::SearchValue { tx }, QueryResult::GetRecord(result)) => {
            if let Ok(GetRecordOk::FoundRecord(found)) = result {
                let _ = tx.send(DhtValue::Value(found.record.value));
            }
            Some(PendingQuery::SearchValue { tx })
        }
        (PendingQuery::GetValue { reply }, QueryResult::GetRecord(result)) => match result {
            Ok(GetRecordOk::FoundRecord(found)) => {
                let _ = reply.send(Ok(found.record.value));
                None
            }
            Ok(_) => Some(PendingQuery::GetValue { reply }),
            Err(e) => {
                let _ = reply.send(Err(HostError::Dht(e.to_string())));
                None
            }
        },
        (PendingQuery::PublicKey { peer, reply }, QueryResult::GetRecord(result)) => {
            match result {
                Ok(GetRecordOk::FoundRecord(found)) => {
                    let key = PublicKey::try_decode_protobuf(&found.record.value)
                        .map_err(|e| HostError::Dht(format!("bad public key record: {e}")))
                        .and_then(|key| {
                            if key.to_peer_id() == peer {
                                Ok(key)
                            } else {
                                Err(HostError::Dht("public key does not match peer id".into()))
                            }
                        });
                    let _ = reply.send(key);
                    None
                }
                Ok(_) => Some(PendingQuery::PublicKey { peer, reply }),
                Err(e) => {
                    let _ = reply.send(Err(HostError::Dht(e.to_string())));
                    None
                }
            }
        }
        (PendingQuery::Write { reply, .. }, QueryResult::PutRecord(result)) => {
            let _ = reply.send(result.map(|_| ()).map_err(|e| HostError::Dht(e.to_string())));
            None
        }
        (PendingQuery::Write { reply, .. }, QueryResult::StartProviding(result)) => {
            let _ = reply.send(result.map(|_| ()).map_err(|e| HostError::Dht(e.to_string())));
            None
        }
        (PendingQuery::Bootstrap, QueryResult::Bootstrap(result)) => {
            match result {
                Ok(ok) => debug!(remaining = ok.num_remaining, "DHT bootstrap progress"),
                Err(e) => warn!(error = %e, "DHT bootstrap failed"),
            }
            Some(PendingQuery::Bootstrap)
        }
        (pending, other) => {
            warn!(result = ?other, "Unexpected DHT query result");
            Some(pending)
        }
    }
}

fn fail_dht_command(command: DhtCommand, error: HostError) {
    match command {
        DhtCommand::FindPeer { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        DhtCommand::ClosestPeers { reply, .. }
        | DhtCommand::Providers { reply, .. }
        | DhtCommand::SearchValue { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        DhtCommand::GetValue { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        DhtCommand::PutValue { reply, .. } | DhtCommand::Provide { reply, .. } => {
            let _ = reply.send(Err(error));
        }
        DhtCommand::PublicKey { reply, .. } => {
            let _ = reply.send(Err(error));
        }
    }
}

/// DHT key under which a peer's public key is published.
fn public_key_record(peer: &PeerId) -> Vec<u8> {
    let mut key = b"/pk/".to_vec();
    key.extend_from_slice(&peer.to_bytes());
    key
}

/// Public key inlined into an identity-multihash peer id.
///
/// Small keys (Ed25519, secp256k1) are embedded directly in the peer id.
fn embedded_public_key(peer: &PeerId) -> Option<PublicKey> {
    let bytes = peer.to_bytes();
    match bytes.as_slice() {
        [0x00, len, digest @ ..] if usize::from(*len) == digest.len() => {
            PublicKey::try_decode_protobuf(digest).ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;
    use std::sync::RwLock;

    fn shared() -> Shared {
        Shared {
            local_peer_id: PeerId::random(),
            announce_addrs: Vec::new(),
            listen_addrs: RwLock::new(Vec::new()),
            connections: RwLock::new(HashMap::new()),
        }
    }

    fn providers_step(providers: HashSet<PeerId>) -> QueryResult {
        QueryResult::GetProviders(Ok(GetProvidersOk::FoundProviders {
            key: kad::RecordKey::new(&b"cid".to_vec()),
            providers,
        }))
    }

    fn random_peers(n: usize) -> HashSet<PeerId> {
        (0..n).map(|_| PeerId::random()).collect()
    }

    #[test]
    fn test_providers_survive_unread_backlog() {
        let shared = shared();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let pending = PendingQuery::Providers {
            remaining: 50,
            seen: HashSet::new(),
            tx,
        };

        // Nothing is read while the first, large step arrives.
        let first = random_peers(40);
        let pending = apply_progress(&shared, pending, providers_step(first.clone()))
            .expect("query still wants providers");

        // Repeats are skipped; new providers fill the count exactly.
        let mut second: HashSet<PeerId> = first.iter().take(5).copied().collect();
        second.extend(random_peers(20));
        assert!(apply_progress(&shared, pending, providers_step(second)).is_none());

        let mut received = HashSet::new();
        while let Ok(value) = rx.try_recv() {
            let DhtValue::Peer(info) = value else {
                panic!("providers are sent as peer infos");
            };
            assert!(received.insert(info.peer), "provider sent twice");
        }
        assert_eq!(received.len(), 50);
        assert!(first.is_subset(&received));
    }

    #[test]
    fn test_search_value_keeps_every_record() {
        let shared = shared();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut pending = PendingQuery::SearchValue { tx };
        for i in 0..64u8 {
            let record = kad::PeerRecord {
                peer: None,
                record: kad::Record::new(kad::RecordKey::new(&b"k".to_vec()), vec![i]),
            };
            let step = QueryResult::GetRecord(Ok(GetRecordOk::FoundRecord(record)));
            pending = apply_progress(&shared, pending, step).expect("search keeps running");
        }
        drop(pending);

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 64);
    }

    #[test]
    fn test_closed_reader_abandons_query() {
        let (tx, rx) = mpsc::unbounded_channel();
        let pending = PendingQuery::SearchValue { tx };
        assert!(!pending.abandoned());
        drop(rx);
        assert!(pending.abandoned());
    }

    #[test]
    fn test_ed25519_key_embedded_in_peer_id() {
        let key = Keypair::generate_ed25519().public();
        let peer = key.to_peer_id();
        assert_eq!(embedded_public_key(&peer), Some(key));
    }

    #[test]
    fn test_random_peer_id_has_no_embedded_key() {
        // PeerId::random uses an identity multihash of random bytes.
        assert!(embedded_public_key(&PeerId::random()).is_none());
    }

    #[test]
    fn test_public_key_record_prefix() {
        let peer = PeerId::random();
        let key = public_key_record(&peer);
        assert!(key.starts_with(b"/pk/"));
        assert_eq!(&key[4..], peer.to_bytes().as_slice());
    }
}
