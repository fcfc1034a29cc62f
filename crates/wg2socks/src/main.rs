use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use wgnet::{Config, Format, Orchestrator, Userspace};

mod relay;

const DEFAULT_LISTEN: SocketAddr =
    SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), 1080);

/// SOCKS5 proxy that egresses through an in-process WireGuard tunnel.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a wg-quick style configuration
    #[arg(short, long, default_value = "wg0.conf")]
    config: PathBuf,
    /// Address the SOCKS5 server listens on [default: the config's, else 127.0.0.1:1080]
    #[arg(short, long)]
    listen: Option<SocketAddr>,
    /// Configuration syntax, guessed from the file extension when omitted
    #[arg(short, long)]
    format: Option<Format>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let format = cli.format.unwrap_or_else(|| Format::detect(&cli.config));
    let config = Config::from_path_with(&cli.config, format)
        .with_context(|| format!("invalid configuration {}", cli.config.display()))?;
    let listen = cli.listen.or(config.listen).unwrap_or(DEFAULT_LISTEN);

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to listen on {listen}"))?;

    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::new(Userspace::new());
    let running = orchestrator
        .start(&config, cancel.clone())
        .context("failed to bring the tunnel up")?;
    tracing::info!(port = running.port(), %listen, peers = config.peers.len(), "tunnel up");

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("interrupted"),
                Err(err) => tracing::error!(%err, "failed to listen for ctrl-c"),
            }
            cancel.cancel();
        }
    });

    let served = relay::serve(listener, running.net().clone(), cancel.clone()).await;
    cancel.cancel();

    for err in running.closed().await {
        tracing::warn!(%err, "teardown incomplete");
    }
    served.context("relay failed")
}
