//! poco relay hub binary.
//!
//! Runs a rendezvous hub until interrupted. Clients find each other by
//! the addresses they register at connect time.

use std::time::Duration;

use clap::Parser;
use poco_relay::{HubConfig, RelayHub};

#[derive(Parser)]
#[command(name = "poco-relay", about = "Rendezvous hub for poco peers")]
struct Cli {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8765")]
    bind: String,

    /// Frame size limit in bytes.
    #[arg(long, default_value = "33554432")]
    max_packet_size: usize,

    /// Seconds a fresh client gets to authenticate.
    #[arg(long, default_value = "10")]
    auth_timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = HubConfig::new(cli.bind)
        .with_max_packet_size(cli.max_packet_size)
        .with_auth_timeout(Duration::from_secs(cli.auth_timeout));

    let hub = RelayHub::bind(config).await?;
    eprintln!("poco-relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("Listening on {}", hub.local_addr());

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupted, shutting down");
    hub.shutdown().await;
    Ok(())
}
