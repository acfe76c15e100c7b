//! UDP master-server registry daemon: entry point. Parses CLI flags, loads
//! configuration, opens the public and (optional) verification sockets, and
//! hands them to the event loop.

mod engine;
mod event_loop;
mod log_format;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use masterd_core::ban::BanFilter;
use masterd_core::config::{BindAddr, Config};
use masterd_core::signer::{DemoSigner, Ed25519DemoSigner};
use tokio::net::UdpSocket;

use engine::ProtocolEngine;
use event_loop::EventLoop;

#[derive(Parser, Debug)]
#[command(name = "masterd", about = "UDP master-server registry daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "masterd.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;

    init_logging(&config)?;

    let public_bind = config
        .server_address
        .clone()
        .context("server_address must be set")?;
    let public_socket = bind(&public_bind).await.context("binding public socket")?;

    let verification_socket = match &config.query_address {
        Some(bind_addr) => Some(bind(bind_addr).await.context("binding verification socket")?),
        None => {
            tracing::warn!("no query_address configured: registrations will never be verified");
            None
        }
    };
    let verification_addr = match &verification_socket {
        Some(s) => Some(s.local_addr()?),
        None => None,
    };

    let ban = BanFilter::new(&config.block_addresses).context("invalid block_addresses pattern")?;

    let signer: Option<Arc<dyn DemoSigner>> = match &config.signing_key {
        Some(seed_hex) => {
            let signer = Ed25519DemoSigner::from_seed_hex(seed_hex).context("loading signing_key")?;
            Some(Arc::new(signer))
        }
        None => {
            tracing::info!("no signing_key configured: signed-demo issuance is disabled");
            None
        }
    };

    let engine = ProtocolEngine::new(
        ban,
        signer,
        config.server_timeout(),
        config.metadata_refresh_time(),
        verification_addr,
    );

    EventLoop::new(public_socket, verification_socket, engine).run().await
}

async fn bind(addr: &BindAddr) -> std::io::Result<UdpSocket> {
    let ip = match &addr.host {
        Some(h) => h.parse().unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    let socket_addr = SocketAddr::new(ip, addr.port);
    UdpSocket::bind(socket_addr).await
}

fn init_logging(config: &Config) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log_file {path}"))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .event_format(log_format::MasterLogFormat)
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            // No log_file configured: fall back to tracing-subscriber's
            // default human-readable formatter on stderr rather than the
            // line-flushed append-mode sink spec.md §6 describes for files.
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}
