//! Peer host facade for the p2pd daemon.
//!
//! The daemon never talks to a network stack directly. It calls into a
//! [`PeerHost`] for identity, dialing, streams and peer listing, and into a
//! [`DhtRouting`] for distributed hash table queries. Inbound streams for
//! registered protocols are handed back to the daemon through an
//! [`InboundHandler`].
//!
//! [`Libp2pHost`] is the concrete backend built on the `libp2p` crates.

pub mod backend;
pub mod config;
pub mod error;
pub mod facade;
pub mod types;

pub use backend::Libp2pHost;
pub use config::{load_identity, ConnLimits, DhtMode, HostConfig};
pub use error::{HostError, HostResult};
pub use facade::{DhtRouting, InboundHandler, PeerHost};
pub use types::{AsyncStream, DhtStream, DhtValue, PeerInfo, PeerStream, StreamInfo};

pub use libp2p::{identity::PublicKey, Multiaddr, PeerId};
