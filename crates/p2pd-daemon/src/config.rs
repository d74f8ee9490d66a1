//! Daemon configuration loaded from a TOML file, with defaults.
//!
//! Every section is optional. Command-line flags are applied on top of the
//! loaded values by the binary, then [`DaemonConfig::validate`] runs before
//! anything is started.

use crate::endpoint::Endpoint;
use crate::error::{DaemonError, DaemonResult};
use libp2p::Multiaddr;
use p2pd_host::{ConnLimits, DhtMode, HostConfig};
use p2pd_wire::DEFAULT_MAX_FRAME_LEN;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Default control endpoint.
pub const DEFAULT_LISTEN: &str = "/unix/tmp/p2pd.sock";

/// Default bound on dial, stream-open and DHT operations.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Public bootstrap nodes used when bootstrapping without an explicit list.
pub const DEFAULT_BOOTSTRAP_PEERS: &[&str] = &[
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmNnooDu7bfjPFoTZYxMNLWUQJyrVwtbZg5gBMjTezGAJN",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmQCU2EcMqAqQPR2i9bChDtGNJchTbq5TbXJJ16u19uLTa",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmbLHAnMoJPWSCR5Zhtx6BHJX9KiKNN6tpvbUcqanj75Nb",
    "/dnsaddr/bootstrap.libp2p.io/p2p/QmcZf59bWwK5XFi76CZX8cbJ4BhTzzA3gU1ZjYZcYW3dwt",
    "/ip4/104.131.131.82/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ",
];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub control: ControlConfig,
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub dht: DhtConfig,
    pub conn_manager: ConnManagerConfig,
}

/// The local control endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Multiaddr of the control socket (`/unix/...` or `/ip4|ip6/.../tcp/...`).
    pub listen: String,
    /// Largest accepted request body, in bytes.
    pub max_frame_len: usize,
    /// Timeout for requests that do not carry their own.
    pub default_timeout_secs: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            default_timeout_secs: DEFAULT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Protobuf-encoded private key. A fresh key is generated when unset.
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub host_addrs: Vec<String>,
    pub announce_addrs: Vec<String>,
    pub no_listen_addrs: bool,
    pub quic: bool,
    /// Connect to bootstrap peers at startup.
    pub bootstrap: bool,
    pub bootstrap_peers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub enabled: bool,
    /// Query the DHT without serving it.
    pub client: bool,
    pub query_timeout_secs: u64,
    pub replication_factor: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            client: false,
            query_timeout_secs: 60,
            replication_factor: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnManagerConfig {
    pub enabled: bool,
    pub low: u32,
    pub high: u32,
    pub grace_secs: u64,
}

impl Default for ConnManagerConfig {
    fn default() -> Self {
        let limits = ConnLimits::default();
        Self {
            enabled: false,
            low: limits.low,
            high: limits.high,
            grace_secs: limits.grace.as_secs(),
        }
    }
}

fn parse_addrs(field: &str, addrs: &[String]) -> DaemonResult<Vec<Multiaddr>> {
    addrs
        .iter()
        .map(|a| {
            a.parse()
                .map_err(|e| DaemonError::Config(format!("{field}: '{a}' is not a multiaddr: {e}")))
        })
        .collect()
}

impl DaemonConfig {
    /// Reject settings that cannot work together.
    pub fn validate(&self) -> DaemonResult<()> {
        if self.control.max_frame_len == 0 {
            return Err(DaemonError::Config("control.max_frame_len must be positive".into()));
        }
        if self.control.default_timeout_secs == 0 {
            return Err(DaemonError::Config(
                "control.default_timeout_secs must be positive".into(),
            ));
        }
        self.listen_endpoint()?;
        if self.conn_manager.enabled && self.conn_manager.low > self.conn_manager.high {
            return Err(DaemonError::Config(format!(
                "conn_manager.low ({}) exceeds conn_manager.high ({})",
                self.conn_manager.low, self.conn_manager.high
            )));
        }
        if self.dht.client && !self.dht.enabled {
            return Err(DaemonError::Config(
                "dht.client requires dht.enabled".into(),
            ));
        }
        parse_addrs("network.host_addrs", &self.network.host_addrs)?;
        parse_addrs("network.announce_addrs", &self.network.announce_addrs)?;
        parse_addrs("network.bootstrap_peers", &self.network.bootstrap_peers)?;
        Ok(())
    }

    /// The parsed control endpoint.
    pub fn listen_endpoint(&self) -> DaemonResult<Endpoint> {
        self.control
            .listen
            .parse()
            .map_err(|e| DaemonError::Config(format!("control.listen: {e}")))
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.control.default_timeout_secs)
    }

    /// Bootstrap peers to dial, falling back to the public defaults.
    pub fn bootstrap_peers(&self) -> DaemonResult<Vec<Multiaddr>> {
        if self.network.bootstrap_peers.is_empty() {
            let defaults: Vec<String> = DEFAULT_BOOTSTRAP_PEERS.iter().map(|a| a.to_string()).collect();
            return parse_addrs("default bootstrap peers", &defaults);
        }
        parse_addrs("network.bootstrap_peers", &self.network.bootstrap_peers)
    }

    /// Settings for building the peer host.
    pub fn host_config(&self) -> DaemonResult<HostConfig> {
        let dht_mode = match (self.dht.enabled, self.dht.client) {
            (false, _) => DhtMode::Off,
            (true, true) => DhtMode::Client,
            (true, false) => DhtMode::Server,
        };
        let conn_limits = self.conn_manager.enabled.then(|| ConnLimits {
            low: self.conn_manager.low,
            high: self.conn_manager.high,
            grace: Duration::from_secs(self.conn_manager.grace_secs),
        });
        let defaults = HostConfig::default();
        Ok(HostConfig {
            listen_addrs: parse_addrs("network.host_addrs", &self.network.host_addrs)?,
            no_listen: self.network.no_listen_addrs,
            announce_addrs: parse_addrs("network.announce_addrs", &self.network.announce_addrs)?,
            quic: self.network.quic,
            dht_mode,
            bootstrap_peers: self.bootstrap_peers()?,
            conn_limits,
            kad_query_timeout: Duration::from_secs(self.dht.query_timeout_secs),
            kad_replication_factor: self.dht.replication_factor,
            idle_connection_timeout: defaults.idle_connection_timeout,
        })
    }
}

/// Load daemon configuration from a TOML file, with defaults.
///
/// A missing or unreadable file is not an error: the daemon starts with
/// defaults and logs why.
pub fn load_config(path: Option<&Path>) -> DaemonConfig {
    let Some(path) = path else {
        return DaemonConfig::default();
    };

    if !path.exists() {
        info!(path = %path.display(), "Config file not found, using defaults");
        return DaemonConfig::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str::<DaemonConfig>(&contents) {
            Ok(config) => {
                info!(path = %path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %path.display(),
                    "Failed to parse config, using defaults"
                );
                DaemonConfig::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                error = %e,
                path = %path.display(),
                "Failed to read config file, using defaults"
            );
            DaemonConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.control.listen, "/unix/tmp/p2pd.sock");
        assert_eq!(config.control.max_frame_len, 4 * 1024 * 1024);
        assert_eq!(config.default_timeout(), Duration::from_secs(60));
        assert!(!config.dht.enabled);
        config.validate().unwrap();

        let host = config.host_config().unwrap();
        assert_eq!(host.dht_mode, DhtMode::Off);
        assert!(host.conn_limits.is_none());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nope.toml")));
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p2pd.toml");
        std::fs::write(
            &path,
            r#"
[control]
listen = "/ip4/127.0.0.1/tcp/9000"

[dht]
enabled = true
client = true

[conn_manager]
enabled = true
low = 10
high = 20
grace_secs = 5
"#,
        )
        .unwrap();

        let config = load_config(Some(&path));
        assert_eq!(
            config.listen_endpoint().unwrap(),
            Endpoint::Tcp("127.0.0.1:9000".parse().unwrap())
        );
        // Unset fields keep their defaults.
        assert_eq!(config.control.max_frame_len, DEFAULT_MAX_FRAME_LEN);
        config.validate().unwrap();

        let host = config.host_config().unwrap();
        assert_eq!(host.dht_mode, DhtMode::Client);
        let limits = host.conn_limits.unwrap();
        assert_eq!((limits.low, limits.high), (10, 20));
        assert_eq!(limits.grace, Duration::from_secs(5));
    }

    #[test]
    fn test_load_invalid_toml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p2pd.toml");
        std::fs::write(&path, "[control\nlisten = ").unwrap();
        assert_eq!(load_config(Some(&path)), DaemonConfig::default());
    }

    #[test]
    fn test_validate_rejects_inverted_watermarks() {
        let mut config = DaemonConfig::default();
        config.conn_manager.enabled = true;
        config.conn_manager.low = 100;
        config.conn_manager.high = 50;
        assert!(matches!(config.validate(), Err(DaemonError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_frame_limit() {
        let mut config = DaemonConfig::default();
        config.control.max_frame_len = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_multiaddr() {
        let mut config = DaemonConfig::default();
        config.network.bootstrap_peers = vec!["not-an-addr".into()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("network.bootstrap_peers"));
    }

    #[test]
    fn test_bootstrap_falls_back_to_public_peers() {
        let config = DaemonConfig::default();
        let peers = config.bootstrap_peers().unwrap();
        assert_eq!(peers.len(), DEFAULT_BOOTSTRAP_PEERS.len());

        let mut config = DaemonConfig::default();
        config.network.bootstrap_peers = vec!["/ip4/10.0.0.1/tcp/4001/p2p/QmaCpDMGvV2BGHeYERUEnRQAwe3N8SzbUtfsmvsqQLuvuJ".into()];
        assert_eq!(config.bootstrap_peers().unwrap().len(), 1);
    }
}
