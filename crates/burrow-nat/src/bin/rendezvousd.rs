//! Burrow rendezvous daemon
//!
//! Publicly reachable peer answering self-port discovery, coordinating
//! hole punches and relaying traffic for peers that could not establish a
//! direct path.

use burrow_nat::{RendezvousServer, RendezvousServerConfig, TraversalError};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Burrow rendezvous and relay peer
#[derive(Parser)]
#[command(name = "rendezvousd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Address to listen on (UDP and TCP)
    #[arg(short, long, default_value = "0.0.0.0:4700")]
    bind: SocketAddr,

    /// Maximum number of concurrent relay sessions
    #[arg(long, default_value_t = 1024)]
    max_relay_sessions: usize,

    /// Seconds a registration stays valid without being refreshed
    #[arg(long, default_value_t = 120)]
    client_timeout: u64,

    /// Seconds a relay session survives without keep-alives or traffic
    #[arg(long, default_value_t = 60)]
    relay_session_timeout: u64,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), TraversalError> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "burrow_nat=debug,rendezvousd=debug"
    } else {
        "burrow_nat=info,rendezvousd=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let config = RendezvousServerConfig {
        max_relay_sessions: cli.max_relay_sessions,
        client_timeout: Duration::from_secs(cli.client_timeout),
        relay_session_timeout: Duration::from_secs(cli.relay_session_timeout),
        ..RendezvousServerConfig::default()
    };

    let server = Arc::new(RendezvousServer::bind_with_config(cli.bind, config).await?);
    tracing::info!(id = %server.id(), bind = %cli.bind, "rendezvousd starting");

    server.run().await;
    Ok(())
}
