//! Control protocol message types.
//!
//! These mirror the proto2 schema existing daemon clients speak. Field tags
//! and `required` markers must not change; the structs are written with
//! `prost` derives instead of generated code so the crate needs no build step.

use libp2p::{Multiaddr, PeerId};

/// A client request. Exactly one payload matching `type` should be set.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(enumeration = "request::Type", required, tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub connect: Option<ConnectRequest>,
    #[prost(message, optional, tag = "3")]
    pub stream_open: Option<StreamOpenRequest>,
    #[prost(message, optional, tag = "4")]
    pub stream_handler: Option<StreamHandlerRequest>,
    #[prost(message, optional, tag = "5")]
    pub dht: Option<DhtRequest>,
    #[prost(message, optional, tag = "7")]
    pub disconnect: Option<DisconnectRequest>,
}

pub mod request {
    /// Request discriminant.
    ///
    /// `ConnManager`, `PubSub` and `Peerstore` exist on the wire but are not
    /// served by this daemon.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Identify = 0,
        Connect = 1,
        StreamOpen = 2,
        StreamHandler = 3,
        Dht = 4,
        ListPeers = 5,
        ConnManager = 6,
        Disconnect = 7,
        PubSub = 8,
        Peerstore = 9,
    }
}

/// The daemon's answer to a request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(enumeration = "response::Type", required, tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub error: Option<ErrorResponse>,
    #[prost(message, optional, tag = "3")]
    pub stream_info: Option<StreamInfo>,
    #[prost(message, optional, tag = "4")]
    pub identify: Option<IdentifyResponse>,
    #[prost(message, optional, tag = "5")]
    pub dht: Option<DhtResponse>,
    #[prost(message, repeated, tag = "6")]
    pub peers: Vec<PeerInfo>,
}

pub mod response {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Ok = 0,
        Error = 1,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IdentifyResponse {
    #[prost(bytes = "vec", required, tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    #[prost(bytes = "vec", required, tag = "1")]
    pub peer: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
    /// Dial timeout in seconds.
    #[prost(int64, optional, tag = "3")]
    pub timeout: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamOpenRequest {
    #[prost(bytes = "vec", required, tag = "1")]
    pub peer: Vec<u8>,
    /// Acceptable protocols, most preferred first.
    #[prost(string, repeated, tag = "2")]
    pub proto: Vec<String>,
    /// Negotiation timeout in seconds.
    #[prost(int64, optional, tag = "3")]
    pub timeout: Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamHandlerRequest {
    /// Local endpoint multiaddr that receives inbound streams.
    #[prost(bytes = "vec", required, tag = "1")]
    pub addr: Vec<u8>,
    #[prost(string, repeated, tag = "2")]
    pub proto: Vec<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ErrorResponse {
    #[prost(string, required, tag = "1")]
    pub msg: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamInfo {
    #[prost(bytes = "vec", required, tag = "1")]
    pub peer: Vec<u8>,
    #[prost(bytes = "vec", required, tag = "2")]
    pub addr: Vec<u8>,
    #[prost(string, required, tag = "3")]
    pub proto: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DhtRequest {
    #[prost(enumeration = "dht_request::Type", required, tag = "1")]
    pub r#type: i32,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub peer: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub cid: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub value: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "6")]
    pub count: Option<i32>,
    /// Query timeout in seconds.
    #[prost(int64, optional, tag = "7")]
    pub timeout: Option<i64>,
}

pub mod dht_request {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        FindPeer = 0,
        FindPeersConnectedToPeer = 1,
        FindProviders = 2,
        GetClosestPeers = 3,
        GetPublicKey = 4,
        GetValue = 5,
        SearchValue = 6,
        PutValue = 7,
        Provide = 8,
    }
}

/// One element of a DHT response stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DhtResponse {
    #[prost(enumeration = "dht_response::Type", required, tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub peer: Option<PeerInfo>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub value: Option<Vec<u8>>,
}

pub mod dht_response {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
    #[repr(i32)]
    pub enum Type {
        Begin = 0,
        Value = 1,
        End = 2,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PeerInfo {
    #[prost(bytes = "vec", required, tag = "1")]
    pub id: Vec<u8>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub addrs: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DisconnectRequest {
    #[prost(bytes = "vec", required, tag = "1")]
    pub peer: Vec<u8>,
}

fn addrs_to_bytes(addrs: &[Multiaddr]) -> Vec<Vec<u8>> {
    addrs.iter().map(|a| a.to_vec()).collect()
}

impl Response {
    /// An OK response with no payload.
    pub fn ok() -> Self {
        Self {
            r#type: response::Type::Ok as i32,
            ..Default::default()
        }
    }

    /// An ERROR response carrying only a message.
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            r#type: response::Type::Error as i32,
            error: Some(ErrorResponse { msg: msg.into() }),
            ..Default::default()
        }
    }

    pub fn identify(peer: &PeerId, addrs: &[Multiaddr]) -> Self {
        Self {
            identify: Some(IdentifyResponse {
                id: peer.to_bytes(),
                addrs: addrs_to_bytes(addrs),
            }),
            ..Self::ok()
        }
    }

    pub fn stream_info(info: StreamInfo) -> Self {
        Self {
            stream_info: Some(info),
            ..Self::ok()
        }
    }

    pub fn peers(peers: Vec<PeerInfo>) -> Self {
        Self {
            peers,
            ..Self::ok()
        }
    }

    pub fn dht(element: DhtResponse) -> Self {
        Self {
            dht: Some(element),
            ..Self::ok()
        }
    }

    /// Whether this is an OK response.
    pub fn is_ok(&self) -> bool {
        self.r#type == response::Type::Ok as i32
    }

    /// The error message, if this is an ERROR response.
    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.msg.as_str())
    }
}

impl DhtResponse {
    pub fn begin() -> Self {
        Self {
            r#type: dht_response::Type::Begin as i32,
            ..Default::default()
        }
    }

    pub fn end() -> Self {
        Self {
            r#type: dht_response::Type::End as i32,
            ..Default::default()
        }
    }

    pub fn peer(peer: PeerInfo) -> Self {
        Self {
            r#type: dht_response::Type::Value as i32,
            peer: Some(peer),
            value: None,
        }
    }

    pub fn with_value(value: Vec<u8>) -> Self {
        Self {
            r#type: dht_response::Type::Value as i32,
            peer: None,
            value: Some(value),
        }
    }
}

impl PeerInfo {
    pub fn new(peer: &PeerId, addrs: &[Multiaddr]) -> Self {
        Self {
            id: peer.to_bytes(),
            addrs: addrs_to_bytes(addrs),
        }
    }
}

impl StreamInfo {
    pub fn new(peer: &PeerId, addr: &Multiaddr, proto: impl Into<String>) -> Self {
        Self {
            peer: peer.to_bytes(),
            addr: addr.to_vec(),
            proto: proto.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_error_response_has_only_message() {
        let resp = Response::error("dial backoff");
        assert!(!resp.is_ok());
        assert_eq!(resp.error_message(), Some("dial backoff"));
        assert!(resp.identify.is_none());
        assert!(resp.stream_info.is_none());
        assert!(resp.dht.is_none());
        assert!(resp.peers.is_empty());
    }

    #[test]
    fn test_response_roundtrip_with_peer_list() {
        let peer = PeerId::random();
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        let resp = Response::peers(vec![PeerInfo::new(&peer, &[addr])]);

        let bytes = resp.encode_to_vec();
        let decoded = Response::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, resp);
        assert_eq!(PeerId::from_bytes(&decoded.peers[0].id).unwrap(), peer);
    }

    #[test]
    fn test_dht_element_types() {
        assert_eq!(DhtResponse::begin().r#type(), dht_response::Type::Begin);
        assert_eq!(DhtResponse::end().r#type(), dht_response::Type::End);
        let value = DhtResponse::with_value(b"v".to_vec());
        assert_eq!(value.r#type(), dht_response::Type::Value);
        assert_eq!(value.value.as_deref(), Some(&b"v"[..]));
        // The derived field getter sits next to the constructors.
        assert_eq!(value.value(), b"v");
        assert!(DhtResponse::end().value().is_empty());
    }

    #[test]
    fn test_field_tags_match_schema() {
        // DISCONNECT lives in field 7; field 6 (connManager) is left unset.
        let req = Request {
            r#type: request::Type::Disconnect as i32,
            disconnect: Some(DisconnectRequest { peer: vec![1, 2] }),
            ..Default::default()
        };
        let bytes = req.encode_to_vec();
        // type: tag 1 varint → 0x08 0x07; disconnect: tag 7 length-delimited → 0x3a
        assert_eq!(&bytes[..3], &[0x08, 0x07, 0x3a]);
    }
}
