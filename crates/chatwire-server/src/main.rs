//! chatwire relay server

use chatwire_server::{ChatServer, Config};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

/// chatwire - multi-client chat relay with file sharing
#[derive(Parser)]
#[command(name = "chatwire-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (overrides the config file)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Storage directory (overrides the config file)
    #[arg(short, long)]
    storage: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default()?,
    };
    if let Some(bind) = cli.bind {
        config.network.listen_addr = bind.to_string();
    }
    if let Some(storage) = cli.storage {
        config.storage.directory = storage;
    }
    config.validate()?;

    // Initialize logging
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(level).init();

    let addr = config.parse_listen_addr()?;
    let server = ChatServer::bind_with_config(addr, config.to_server_config()).await?;

    server
        .run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("failed to listen for ctrl-c: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("shutdown complete");
    Ok(())
}
