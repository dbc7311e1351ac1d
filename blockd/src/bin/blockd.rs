//! blockd daemon - serves NBD exports over TCP or Unix sockets.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UnixListener};
use tokio::signal;
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use blockd::{Config, Daemon, ExportConfig, Network, Server};

#[derive(Parser)]
#[command(name = "blockd", about = "User-space NBD server")]
struct Cli {
    /// Path to config file. Flags below override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to a file to expose (shorthand for a single file export).
    #[arg(long)]
    file: Option<PathBuf>,

    /// Export name for --file.
    #[arg(long, default_value = "default")]
    name: String,

    /// Export description for --file.
    #[arg(long, default_value = "The default export")]
    description: String,

    /// Listen address (host:port for tcp, a path for unix).
    #[arg(long)]
    addr: Option<String>,

    /// Listen network (tcp or unix).
    #[arg(long)]
    network: Option<String>,

    /// Serve every export read-only.
    #[arg(long)]
    read_only: bool,

    /// Minimum block size advertised to clients.
    #[arg(long)]
    minimum_block_size: Option<u32>,

    /// Preferred block size advertised to clients.
    #[arg(long)]
    preferred_block_size: Option<u32>,

    /// Maximum block size advertised to clients.
    #[arg(long)]
    maximum_block_size: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = match cli.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("failed to load config: {}", path.display()))?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(file) = cli.file {
        config.exports.push(ExportConfig {
            name: cli.name.clone(),
            description: cli.description.clone(),
            file: Some(file),
            size_bytes: None,
        });
    }
    if cli.read_only {
        config.server.read_only = true;
    }
    if let Some(v) = cli.minimum_block_size {
        config.server.minimum_block_size = v;
    }
    if let Some(v) = cli.preferred_block_size {
        config.server.preferred_block_size = v;
    }
    if let Some(v) = cli.maximum_block_size {
        config.server.maximum_block_size = v;
    }
    if let Some(addr) = cli.addr {
        config.listen.address = addr;
    }
    if let Some(ref network) = cli.network {
        config.listen.network = network.parse()?;
    }

    config.validate().context("invalid configuration")?;

    let exports = config.build_exports().context("failed to build exports")?;
    let server = Server::new(exports, config.server.clone())?;
    let daemon = Daemon::new(server);

    info!(
        address = %config.listen.address,
        exports = config.exports.len(),
        read_only = config.server.read_only,
        "blockd started"
    );

    // Stale socket files keep a unix bind from succeeding.
    if config.listen.network == Network::Unix {
        let path = PathBuf::from(&config.listen.address);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
    }

    let listen_handle = {
        let daemon = daemon.clone();
        let listen = config.listen.clone();
        tokio::spawn(async move {
            let result = match listen.network {
                Network::Tcp => match TcpListener::bind(&listen.address).await {
                    Ok(listener) => {
                        info!(address = %listen.address, "NBD server listening");
                        daemon.listen(listener).await
                    }
                    Err(e) => {
                        error!(error = %e, "failed to bind NBD listener");
                        return;
                    }
                },
                Network::Unix => match UnixListener::bind(&listen.address) {
                    Ok(listener) => {
                        info!(path = %listen.address, "NBD server listening");
                        daemon.listen(listener).await
                    }
                    Err(e) => {
                        error!(error = %e, "failed to bind NBD listener");
                        return;
                    }
                },
            };
            if let Err(e) = result {
                error!(error = %e, "NBD server error");
            }
        })
    };

    // Wait for shutdown signal
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to register SIGTERM handler")?;
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.context("failed to wait for Ctrl+C")?;
        info!("received SIGINT");
    }

    listen_handle.abort();

    if config.listen.network == Network::Unix {
        let _ = std::fs::remove_file(&config.listen.address);
    }

    Ok(())
}
