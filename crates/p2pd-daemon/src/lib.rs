//! p2pd control daemon.
//!
//! Local clients connect to a control endpoint (Unix socket or TCP) and
//! exchange length-prefixed protobuf messages with the daemon, which performs
//! the requested operations through a [`p2pd_host::PeerHost`].
//!
//! ## Layout
//!
//! - **listener**: binds the control endpoint, one task per connection
//! - **dispatcher**: per-connection request loop and tunnel hand-off
//! - **dht**: DHT queries, including BEGIN/VALUE/END response streaming
//! - **registry**: protocol → local handler endpoint, inbound stream routing
//! - **proxy**: bidirectional byte relay between two streams
//! - **endpoint**: local socket addresses expressed as multiaddrs
//! - **config**: TOML configuration with defaults

pub mod config;
pub mod dht;
pub mod dispatcher;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod proxy;
pub mod registry;

pub use config::{load_config, DaemonConfig};
pub use dispatcher::Dispatcher;
pub use endpoint::Endpoint;
pub use error::{DaemonError, DaemonResult};
pub use listener::Daemon;
pub use registry::{HandlerRegistry, InboundRouter};
