//! Validated request model.
//!
//! The protobuf schema allows any combination of payloads. [`ControlRequest`]
//! is the shape the daemon actually acts on: the tag and its payload always
//! agree, peer ids and multiaddrs are parsed, and per-kind DHT requirements
//! are checked. Conversion back into the raw schema is provided for clients
//! and tests.

use crate::message::{
    dht_request, request, ConnectRequest, DhtRequest, DisconnectRequest, Request,
    StreamHandlerRequest, StreamOpenRequest,
};
use libp2p::{Multiaddr, PeerId};
use std::time::Duration;
use thiserror::Error;

/// Result count used by FIND_PROVIDERS when the client gives none.
pub const DEFAULT_PROVIDER_COUNT: usize = 20;

/// A well-formed frame that does not describe a valid request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Malformed {kind} request: missing {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("Malformed {kind} request: unexpected {field} payload")]
    UnexpectedPayload {
        kind: &'static str,
        field: &'static str,
    },
    #[error("Unsupported request type: {0}")]
    UnsupportedRequest(i32),
    #[error("Unsupported DHT request type: {0}")]
    UnsupportedDht(i32),
    #[error("Invalid peer id: {0}")]
    InvalidPeerId(String),
    #[error("Invalid multiaddr: {0}")]
    InvalidMultiaddr(String),
    #[error("Invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

/// A request whose tag and payload have been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Identify,
    Connect {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        timeout: Option<Duration>,
    },
    Disconnect {
        peer: PeerId,
    },
    StreamOpen {
        peer: PeerId,
        protocols: Vec<String>,
        timeout: Option<Duration>,
    },
    StreamHandler {
        addr: Multiaddr,
        protocols: Vec<String>,
    },
    Dht(DhtQuery),
    ListPeers,
}

/// A DHT query plus its optional streaming deadline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhtQuery {
    pub kind: DhtKind,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhtKind {
    FindPeer { peer: PeerId },
    FindPeersConnectedToPeer { peer: PeerId },
    FindProviders { cid: Vec<u8>, count: usize },
    GetClosestPeers { key: Vec<u8> },
    GetPublicKey { peer: PeerId },
    GetValue { key: Vec<u8> },
    SearchValue { key: Vec<u8> },
    PutValue { key: Vec<u8>, value: Vec<u8> },
    Provide { cid: Vec<u8> },
}

impl ControlRequest {
    /// Wire name of the request kind, as used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Identify => "IDENTIFY",
            Self::Connect { .. } => "CONNECT",
            Self::Disconnect { .. } => "DISCONNECT",
            Self::StreamOpen { .. } => "STREAM_OPEN",
            Self::StreamHandler { .. } => "STREAM_HANDLER",
            Self::Dht(_) => "DHT",
            Self::ListPeers => "LIST_PEERS",
        }
    }
}

impl DhtKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FindPeer { .. } => "FIND_PEER",
            Self::FindPeersConnectedToPeer { .. } => "FIND_PEERS_CONNECTED_TO_PEER",
            Self::FindProviders { .. } => "FIND_PROVIDERS",
            Self::GetClosestPeers { .. } => "GET_CLOSEST_PEERS",
            Self::GetPublicKey { .. } => "GET_PUBLIC_KEY",
            Self::GetValue { .. } => "GET_VALUE",
            Self::SearchValue { .. } => "SEARCH_VALUE",
            Self::PutValue { .. } => "PUT_VALUE",
            Self::Provide { .. } => "PROVIDE",
        }
    }
}

fn parse_peer(bytes: &[u8]) -> Result<PeerId, ValidationError> {
    PeerId::from_bytes(bytes).map_err(|e| ValidationError::InvalidPeerId(e.to_string()))
}

fn parse_addr(bytes: Vec<u8>) -> Result<Multiaddr, ValidationError> {
    Multiaddr::try_from(bytes).map_err(|e| ValidationError::InvalidMultiaddr(e.to_string()))
}

fn parse_addrs(addrs: Vec<Vec<u8>>) -> Result<Vec<Multiaddr>, ValidationError> {
    addrs.into_iter().map(parse_addr).collect()
}

fn parse_timeout(secs: Option<i64>) -> Result<Option<Duration>, ValidationError> {
    match secs {
        None => Ok(None),
        Some(s) if s > 0 => Ok(Some(Duration::from_secs(s as u64))),
        Some(s) => Err(ValidationError::InvalidField {
            field: "timeout",
            reason: format!("must be a positive number of seconds, got {s}"),
        }),
    }
}

fn parse_protocols(
    kind: &'static str,
    protocols: Vec<String>,
) -> Result<Vec<String>, ValidationError> {
    if protocols.is_empty() {
        return Err(ValidationError::MissingField {
            kind,
            field: "proto",
        });
    }
    if let Some(bad) = protocols.iter().find(|p| !p.starts_with('/')) {
        return Err(ValidationError::InvalidField {
            field: "proto",
            reason: format!("protocol id '{bad}' must start with '/'"),
        });
    }
    Ok(protocols)
}

/// Reject payloads that do not belong to the request's tag.
fn only_payload(req: &Request, kind: &'static str, expected: &str) -> Result<(), ValidationError> {
    let populated = [
        ("connect", req.connect.is_some()),
        ("streamOpen", req.stream_open.is_some()),
        ("streamHandler", req.stream_handler.is_some()),
        ("dht", req.dht.is_some()),
        ("disconnect", req.disconnect.is_some()),
    ];
    match populated
        .iter()
        .find(|(field, set)| *set && *field != expected)
    {
        Some((field, _)) => Err(ValidationError::UnexpectedPayload { kind, field }),
        None => Ok(()),
    }
}

fn require<T>(
    payload: Option<T>,
    kind: &'static str,
    field: &'static str,
) -> Result<T, ValidationError> {
    payload.ok_or(ValidationError::MissingField { kind, field })
}

impl TryFrom<Request> for ControlRequest {
    type Error = ValidationError;

    fn try_from(req: Request) -> Result<Self, ValidationError> {
        let tag = request::Type::try_from(req.r#type)
            .map_err(|_| ValidationError::UnsupportedRequest(req.r#type))?;
        match tag {
            request::Type::Identify => {
                only_payload(&req, "IDENTIFY", "")?;
                Ok(Self::Identify)
            }
            request::Type::ListPeers => {
                only_payload(&req, "LIST_PEERS", "")?;
                Ok(Self::ListPeers)
            }
            request::Type::Connect => {
                only_payload(&req, "CONNECT", "connect")?;
                let connect = require(req.connect, "CONNECT", "connect")?;
                Ok(Self::Connect {
                    peer: parse_peer(&connect.peer)?,
                    addrs: parse_addrs(connect.addrs)?,
                    timeout: parse_timeout(connect.timeout)?,
                })
            }
            request::Type::Disconnect => {
                only_payload(&req, "DISCONNECT", "disconnect")?;
                let disconnect = require(req.disconnect, "DISCONNECT", "disconnect")?;
                Ok(Self::Disconnect {
                    peer: parse_peer(&disconnect.peer)?,
                })
            }
            request::Type::StreamOpen => {
                only_payload(&req, "STREAM_OPEN", "streamOpen")?;
                let open = require(req.stream_open, "STREAM_OPEN", "streamOpen")?;
                Ok(Self::StreamOpen {
                    peer: parse_peer(&open.peer)?,
                    protocols: parse_protocols("STREAM_OPEN", open.proto)?,
                    timeout: parse_timeout(open.timeout)?,
                })
            }
            request::Type::StreamHandler => {
                only_payload(&req, "STREAM_HANDLER", "streamHandler")?;
                let handler = require(req.stream_handler, "STREAM_HANDLER", "streamHandler")?;
                Ok(Self::StreamHandler {
                    addr: parse_addr(handler.addr)?,
                    protocols: parse_protocols("STREAM_HANDLER", handler.proto)?,
                })
            }
            request::Type::Dht => {
                only_payload(&req, "DHT", "dht")?;
                let dht = require(req.dht, "DHT", "dht")?;
                Ok(Self::Dht(DhtQuery::try_from(dht)?))
            }
            request::Type::ConnManager | request::Type::PubSub | request::Type::Peerstore => {
                Err(ValidationError::UnsupportedRequest(req.r#type))
            }
        }
    }
}

impl TryFrom<DhtRequest> for DhtQuery {
    type Error = ValidationError;

    fn try_from(req: DhtRequest) -> Result<Self, ValidationError> {
        let tag = dht_request::Type::try_from(req.r#type)
            .map_err(|_| ValidationError::UnsupportedDht(req.r#type))?;
        let timeout = parse_timeout(req.timeout)?;

        let kind = match tag {
            dht_request::Type::FindPeer => DhtKind::FindPeer {
                peer: parse_peer(&require(req.peer, "FIND_PEER", "peer")?)?,
            },
            dht_request::Type::FindPeersConnectedToPeer => DhtKind::FindPeersConnectedToPeer {
                peer: parse_peer(&require(req.peer, "FIND_PEERS_CONNECTED_TO_PEER", "peer")?)?,
            },
            dht_request::Type::FindProviders => {
                let count = match req.count {
                    None => DEFAULT_PROVIDER_COUNT,
                    Some(c) if c > 0 => c as usize,
                    Some(c) => {
                        return Err(ValidationError::InvalidField {
                            field: "count",
                            reason: format!("must be positive, got {c}"),
                        })
                    }
                };
                DhtKind::FindProviders {
                    cid: require(req.cid, "FIND_PROVIDERS", "cid")?,
                    count,
                }
            }
            dht_request::Type::GetClosestPeers => DhtKind::GetClosestPeers {
                key: require(req.key, "GET_CLOSEST_PEERS", "key")?,
            },
            dht_request::Type::GetPublicKey => DhtKind::GetPublicKey {
                peer: parse_peer(&require(req.peer, "GET_PUBLIC_KEY", "peer")?)?,
            },
            dht_request::Type::GetValue => DhtKind::GetValue {
                key: require(req.key, "GET_VALUE", "key")?,
            },
            dht_request::Type::SearchValue => DhtKind::SearchValue {
                key: require(req.key, "SEARCH_VALUE", "key")?,
            },
            dht_request::Type::PutValue => DhtKind::PutValue {
                key: require(req.key, "PUT_VALUE", "key")?,
                value: require(req.value, "PUT_VALUE", "value")?,
            },
            dht_request::Type::Provide => DhtKind::Provide {
                cid: require(req.cid, "PROVIDE", "cid")?,
            },
        };
        Ok(Self { kind, timeout })
    }
}

fn timeout_secs(timeout: Option<Duration>) -> Option<i64> {
    timeout.map(|t| t.as_secs() as i64)
}

impl From<DhtQuery> for DhtRequest {
    fn from(query: DhtQuery) -> Self {
        let mut req = DhtRequest {
            timeout: timeout_secs(query.timeout),
            ..Default::default()
        };
        let tag = match query.kind {
            DhtKind::FindPeer { peer } => {
                req.peer = Some(peer.to_bytes());
                dht_request::Type::FindPeer
            }
            DhtKind::FindPeersConnectedToPeer { peer } => {
                req.peer = Some(peer.to_bytes());
                dht_request::Type::FindPeersConnectedToPeer
            }
            DhtKind::FindProviders { cid, count } => {
                req.cid = Some(cid);
                req.count = Some(count as i32);
                dht_request::Type::FindProviders
            }
            DhtKind::GetClosestPeers { key } => {
                req.key = Some(key);
                dht_request::Type::GetClosestPeers
            }
            DhtKind::GetPublicKey { peer } => {
                req.peer = Some(peer.to_bytes());
                dht_request::Type::GetPublicKey
            }
            DhtKind::GetValue { key } => {
                req.key = Some(key);
                dht_request::Type::GetValue
            }
            DhtKind::SearchValue { key } => {
                req.key = Some(key);
                dht_request::Type::SearchValue
            }
            DhtKind::PutValue { key, value } => {
                req.key = Some(key);
                req.value = Some(value);
                dht_request::Type::PutValue
            }
            DhtKind::Provide { cid } => {
                req.cid = Some(cid);
                dht_request::Type::Provide
            }
        };
        req.r#type = tag as i32;
        req
    }
}

impl From<ControlRequest> for Request {
    fn from(req: ControlRequest) -> Self {
        let with_type = |tag: request::Type| Request {
            r#type: tag as i32,
            ..Default::default()
        };
        match req {
            ControlRequest::Identify => with_type(request::Type::Identify),
            ControlRequest::ListPeers => with_type(request::Type::ListPeers),
            ControlRequest::Connect {
                peer,
                addrs,
                timeout,
            } => Request {
                connect: Some(ConnectRequest {
                    peer: peer.to_bytes(),
                    addrs: addrs.iter().map(|a| a.to_vec()).collect(),
                    timeout: timeout_secs(timeout),
                }),
                ..with_type(request::Type::Connect)
            },
            ControlRequest::Disconnect { peer } => Request {
                disconnect: Some(DisconnectRequest {
                    peer: peer.to_bytes(),
                }),
                ..with_type(request::Type::Disconnect)
            },
            ControlRequest::StreamOpen {
                peer,
                protocols,
                timeout,
            } => Request {
                stream_open: Some(StreamOpenRequest {
                    peer: peer.to_bytes(),
                    proto: protocols,
                    timeout: timeout_secs(timeout),
                }),
                ..with_type(request::Type::StreamOpen)
            },
            ControlRequest::StreamHandler { addr, protocols } => Request {
                stream_handler: Some(StreamHandlerRequest {
                    addr: addr.to_vec(),
                    proto: protocols,
                }),
                ..with_type(request::Type::StreamHandler)
            },
            ControlRequest::Dht(query) => Request {
                dht: Some(query.into()),
                ..with_type(request::Type::Dht)
            },
        }
    }
}
