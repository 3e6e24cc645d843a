//! # Parley Server
//!
//! Listens for server-to-server connections and hands each one to the
//! federation core. Outbound sessions are created on demand by whoever calls
//! `Federation::authenticate_domain`.

use std::net::SocketAddr;

use clap::Parser;
use parley_federation::Federation;

#[derive(Debug, Parser)]
#[command(name = "parley", version, about = "Parley server-to-server endpoint")]
struct Args {
    /// Config file (TOML). Defaults to `config.toml` when present.
    #[arg(long, env = "PARLEY_CONFIG")]
    config: Option<String>,

    /// Log filter, e.g. `parley=debug,parley_federation=trace`.
    #[arg(long, env = "PARLEY_LOG")]
    log: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = parley_common::config::init(args.config.as_deref())?;

    // Initialize tracing (structured logging)
    let filter = match &args.log {
        Some(filter) => tracing_subscriber::EnvFilter::try_new(filter)?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "parley=debug,parley_federation=debug".into()),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    tracing::info!("Starting Parley v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        domain = %config.server.domain,
        hosted = ?config.server.hosted_domains,
        dialback = config.dialback.enabled,
        tls = config.tls.enabled,
        "federation settings loaded"
    );
    if config.dialback.secret.is_empty() {
        tracing::warn!("no dialback secret configured, generated a random one for this run");
    }

    let federation = Federation::from_app_config(config)?;

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("S2S listening on {addr}");

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("accept failed: {e}");
                continue;
            }
        };
        let _ = socket.set_nodelay(true);
        let federation = federation.clone();
        tokio::spawn(async move {
            federation.accept(Box::new(socket), &peer.to_string()).await;
        });
    }
}
