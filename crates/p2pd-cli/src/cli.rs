//! Clap CLI definitions for p2pd.

use clap::Parser;
use p2pd_daemon::DaemonConfig;
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  p2pd                                   Control socket at /unix/tmp/p2pd.sock
  p2pd --listen /ip4/127.0.0.1/tcp/5005  Control endpoint over TCP
  p2pd --dht -b                          Full DHT node, bootstrap from IPFS peers
  p2pd --config p2pd.toml --quic         Load settings, then enable QUIC

Flags override values from the config file.";

/// A libp2p daemon driven over a local control socket.
#[derive(Debug, Parser)]
#[command(name = "p2pd", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to a TOML config file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Control endpoint multiaddr (/unix/<path> or /ip4/<addr>/tcp/<port>).
    #[arg(long)]
    pub listen: Option<String>,

    /// Peer identity: protobuf-encoded private key file.
    #[arg(long)]
    pub id: Option<PathBuf>,

    /// Log warnings only and skip the startup banner.
    #[arg(short, long)]
    pub quiet: bool,

    /// Connect to bootstrap peers and bootstrap the DHT if enabled.
    #[arg(short = 'b', long)]
    pub bootstrap: bool,

    /// Comma-separated bootstrap peers; defaults to the IPFS DHT peers.
    #[arg(long, value_delimiter = ',')]
    pub bootstrap_peers: Vec<String>,

    /// Enable the DHT in full (server) mode.
    #[arg(long)]
    pub dht: bool,

    /// Enable the DHT in client mode.
    #[arg(long, conflicts_with = "dht")]
    pub dht_client: bool,

    /// Enable connection limits.
    #[arg(long)]
    pub conn_manager: bool,

    /// Connection manager low water mark.
    #[arg(long)]
    pub conn_lo: Option<u32>,

    /// Connection manager high water mark.
    #[arg(long)]
    pub conn_hi: Option<u32>,

    /// Connection manager grace period, in seconds.
    #[arg(long)]
    pub conn_grace: Option<u64>,

    /// Enable the QUIC transport.
    #[arg(long)]
    pub quic: bool,

    /// Comma-separated multiaddrs the host listens on.
    #[arg(long, value_delimiter = ',')]
    pub host_addrs: Vec<String>,

    /// Comma-separated multiaddrs the host announces instead of its listen addresses.
    #[arg(long, value_delimiter = ',')]
    pub announce_addrs: Vec<String>,

    /// Listen on no network addresses.
    #[arg(long)]
    pub no_listen_addrs: bool,

    /// Largest accepted control message body, in bytes.
    #[arg(long)]
    pub max_frame_len: Option<usize>,
}

impl Cli {
    /// Overlay the given flags on a loaded configuration.
    pub fn apply(&self, config: &mut DaemonConfig) {
        if let Some(listen) = &self.listen {
            config.control.listen = listen.clone();
        }
        if let Some(max) = self.max_frame_len {
            config.control.max_frame_len = max;
        }
        if let Some(id) = &self.id {
            config.identity.key_file = Some(id.clone());
        }

        let network = &mut config.network;
        network.bootstrap |= self.bootstrap;
        if !self.bootstrap_peers.is_empty() {
            network.bootstrap_peers = self.bootstrap_peers.clone();
        }
        network.quic |= self.quic;
        network.no_listen_addrs |= self.no_listen_addrs;
        if !self.host_addrs.is_empty() {
            network.host_addrs = self.host_addrs.clone();
        }
        if !self.announce_addrs.is_empty() {
            network.announce_addrs = self.announce_addrs.clone();
        }

        if self.dht {
            config.dht.enabled = true;
            config.dht.client = false;
        } else if self.dht_client {
            config.dht.enabled = true;
            config.dht.client = true;
        }

        let conn = &mut config.conn_manager;
        conn.enabled |= self.conn_manager;
        if let Some(lo) = self.conn_lo {
            conn.low = lo;
        }
        if let Some(hi) = self.conn_hi {
            conn.high = hi;
        }
        if let Some(grace) = self.conn_grace {
            conn.grace_secs = grace;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("p2pd").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_no_flags_keep_config() {
        let mut config = DaemonConfig::default();
        parse(&[]).apply(&mut config);
        assert_eq!(config, DaemonConfig::default());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = parse(&[
            "--listen",
            "/ip4/127.0.0.1/tcp/5005",
            "-q",
            "-b",
            "--bootstrap-peers",
            "/ip4/10.0.0.1/tcp/4001,/ip4/10.0.0.2/tcp/4001",
            "--dht-client",
            "--conn-manager",
            "--conn-lo",
            "10",
            "--conn-hi",
            "20",
            "--conn-grace",
            "5",
            "--quic",
            "--host-addrs",
            "/ip4/0.0.0.0/tcp/4001",
            "--max-frame-len",
            "1024",
        ]);
        assert!(cli.quiet);

        let mut config = DaemonConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.control.listen, "/ip4/127.0.0.1/tcp/5005");
        assert_eq!(config.control.max_frame_len, 1024);
        assert!(config.network.bootstrap);
        assert_eq!(config.network.bootstrap_peers.len(), 2);
        assert!(config.network.quic);
        assert_eq!(config.network.host_addrs, vec!["/ip4/0.0.0.0/tcp/4001"]);
        assert!(config.dht.enabled && config.dht.client);
        assert!(config.conn_manager.enabled);
        assert_eq!(
            (config.conn_manager.low, config.conn_manager.high, config.conn_manager.grace_secs),
            (10, 20, 5)
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_dht_flags_conflict() {
        assert!(Cli::try_parse_from(["p2pd", "--dht", "--dht-client"]).is_err());
    }

    #[test]
    fn test_full_dht_overrides_client_config() {
        let mut config = DaemonConfig::default();
        config.dht.enabled = true;
        config.dht.client = true;
        parse(&["--dht"]).apply(&mut config);
        assert!(config.dht.enabled && !config.dht.client);
    }
}
