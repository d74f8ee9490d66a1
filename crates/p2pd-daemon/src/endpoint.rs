//! Local endpoint addresses.
//!
//! Both the control socket and protocol handler targets are named by
//! multiaddrs: `/unix/<path>` for Unix domain sockets or
//! `/ip4|ip6/<addr>/tcp/<port>` for TCP.

use crate::error::{DaemonError, DaemonResult};
use libp2p::multiaddr::Protocol;
use libp2p::Multiaddr;
use p2pd_host::PeerStream;
use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use tokio::net::TcpStream;

/// A local socket address the daemon can bind or connect to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl Endpoint {
    /// Interpret a binary-decoded multiaddr as a local endpoint.
    pub fn from_multiaddr(addr: &Multiaddr) -> DaemonResult<Self> {
        let invalid = |reason: &str| DaemonError::Endpoint {
            addr: describe(addr),
            reason: reason.to_string(),
        };
        let mut protocols = addr.iter();
        let endpoint = match (protocols.next(), protocols.next()) {
            (Some(Protocol::Unix(path)), None) => {
                if path.is_empty() {
                    return Err(invalid("empty socket path"));
                }
                Self::Unix(unix_path(&path))
            }
            (Some(Protocol::Ip4(ip)), Some(Protocol::Tcp(port))) => {
                Self::Tcp(SocketAddr::new(IpAddr::V4(ip), port))
            }
            (Some(Protocol::Ip6(ip)), Some(Protocol::Tcp(port))) => {
                Self::Tcp(SocketAddr::new(IpAddr::V6(ip), port))
            }
            _ => return Err(invalid("expected /unix/<path> or /ip4|ip6/<addr>/tcp/<port>")),
        };
        if protocols.next().is_some() {
            return Err(invalid("trailing protocols"));
        }
        Ok(endpoint)
    }

    /// The multiaddr form of this endpoint.
    pub fn to_multiaddr(&self) -> Multiaddr {
        match self {
            Self::Unix(path) => Multiaddr::empty().with(Protocol::Unix(Cow::Owned(
                path.to_string_lossy().into_owned(),
            ))),
            Self::Tcp(addr) => Multiaddr::from(addr.ip()).with(Protocol::Tcp(addr.port())),
        }
    }

    /// Open a connection to the endpoint.
    pub async fn connect(&self) -> DaemonResult<PeerStream> {
        let resource = |source| DaemonError::Resource {
            addr: self.to_string(),
            source,
        };
        match self {
            #[cfg(unix)]
            Self::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path)
                    .await
                    .map_err(resource)?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            Self::Unix(_) => Err(DaemonError::Endpoint {
                addr: self.to_string(),
                reason: "unix sockets are not supported on this platform".into(),
            }),
            Self::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await.map_err(resource)?;
                stream.set_nodelay(true).map_err(resource)?;
                Ok(Box::new(stream))
            }
        }
    }
}

/// Unix paths in multiaddrs are absolute; tolerate a missing leading slash.
fn unix_path(path: &str) -> PathBuf {
    if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        PathBuf::from(format!("/{path}"))
    }
}

fn describe(addr: &Multiaddr) -> String {
    match addr.iter().next() {
        Some(Protocol::Unix(path)) => format!("/unix{}", unix_path(&path).display()),
        _ => addr.to_string(),
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "/unix{}", path.display()),
            Self::Tcp(_) => write!(f, "{}", self.to_multiaddr()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = DaemonError;

    /// Parse the text form. Unix paths keep their slashes, so `/unix/` is
    /// split off by hand rather than through the multiaddr parser.
    fn from_str(s: &str) -> DaemonResult<Self> {
        if let Some(path) = s.strip_prefix("/unix/") {
            if path.is_empty() {
                return Err(DaemonError::Endpoint {
                    addr: s.to_string(),
                    reason: "empty socket path".into(),
                });
            }
            return Ok(Self::Unix(unix_path(path)));
        }
        let addr: Multiaddr = s.parse().map_err(|e| DaemonError::Endpoint {
            addr: s.to_string(),
            reason: format!("{e}"),
        })?;
        Self::from_multiaddr(&addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unix_text() {
        let endpoint: Endpoint = "/unix/tmp/p2pd.sock".parse().unwrap();
        assert_eq!(endpoint, Endpoint::Unix(PathBuf::from("/tmp/p2pd.sock")));
        assert_eq!(endpoint.to_string(), "/unix/tmp/p2pd.sock");
    }

    #[test]
    fn test_parse_tcp_text() {
        let endpoint: Endpoint = "/ip4/127.0.0.1/tcp/9000".parse().unwrap();
        assert_eq!(endpoint, Endpoint::Tcp("127.0.0.1:9000".parse().unwrap()));
        assert_eq!(endpoint.to_string(), "/ip4/127.0.0.1/tcp/9000");

        let endpoint: Endpoint = "/ip6/::1/tcp/9000".parse().unwrap();
        assert_eq!(endpoint, Endpoint::Tcp("[::1]:9000".parse().unwrap()));
    }

    #[test]
    fn test_binary_multiaddr_roundtrip() {
        for endpoint in [
            Endpoint::Unix(PathBuf::from("/run/p2pd/handler.sock")),
            Endpoint::Tcp("10.1.2.3:4001".parse().unwrap()),
        ] {
            let bytes = endpoint.to_multiaddr().to_vec();
            let decoded = Multiaddr::try_from(bytes).unwrap();
            assert_eq!(Endpoint::from_multiaddr(&decoded).unwrap(), endpoint);
        }
    }

    #[test]
    fn test_reject_non_local_multiaddrs() {
        for text in [
            "/ip4/127.0.0.1/udp/9000",
            "/ip4/127.0.0.1",
            "/ip4/127.0.0.1/tcp/9000/ws",
            "/dns4/example.com/tcp/80",
            "/unix/",
        ] {
            assert!(
                matches!(text.parse::<Endpoint>(), Err(DaemonError::Endpoint { .. })),
                "{text} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_connect_refused_is_resource_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = match Endpoint::Tcp(addr).connect().await {
            Err(e) => e,
            Ok(_) => panic!("connect to a closed port succeeded"),
        };
        assert!(matches!(err, DaemonError::Resource { .. }));
    }
}
