//! p2pd: a libp2p host controlled by local clients over a Unix or TCP socket.

mod cli;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use p2pd_daemon::{load_config, DaemonConfig, Daemon, Dispatcher, HandlerRegistry};
use p2pd_host::{load_identity, Libp2pHost, PeerHost};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing_stderr(quiet: bool) {
    let default = if quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Resolve on Ctrl+C, or SIGTERM on Unix.
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

fn print_banner(daemon: &Daemon, host: &dyn PeerHost, config: &DaemonConfig) -> anyhow::Result<()> {
    let (peer_id, addrs) = host.local_identity();
    println!("Control socket: {}", daemon.endpoint());
    println!("Peer ID: {peer_id}");
    println!("Peer Addrs:");
    for addr in addrs {
        println!("{addr}");
    }
    if config.network.bootstrap {
        println!("Bootstrap peers:");
        for peer in config.bootstrap_peers()? {
            println!("{peer}");
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing_stderr(cli.quiet);

    let mut config = load_config(cli.config.as_deref());
    cli.apply(&mut config);
    config.validate()?;

    let keypair =
        load_identity(config.identity.key_file.as_deref()).context("Failed to load identity")?;
    let host = Arc::new(
        Libp2pHost::spawn(keypair, config.host_config()?)
            .await
            .context("Failed to start peer host")?,
    );

    if config.network.bootstrap {
        host.bootstrap().await.context("Bootstrap failed")?;
    }

    let dispatcher = Dispatcher::new(
        host.clone(),
        HandlerRegistry::new(),
        config.default_timeout(),
        config.control.max_frame_len,
    );
    let daemon = Daemon::start(&config.listen_endpoint()?, dispatcher).await?;

    if !cli.quiet {
        print_banner(&daemon, host.as_ref(), &config)?;
    }

    shutdown_signal()
        .await
        .context("Failed to install signal handler")?;
    info!("Shutting down");
    daemon.shutdown().await;
    host.shutdown().await;
    Ok(())
}
