//! Streamgate server binary
//!
//! Usage:
//!   streamgate --config config/streamgate.toml
//!   streamgate --listen 127.0.0.1:9002 --home /opt/streamgate

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use stream_server::Server;
use streamgate_config::ServerConfig;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "streamgate")]
#[command(about = "Streamgate pipeline negotiation and streaming server")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Home directory, overrides the configuration
    #[arg(long)]
    home: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info,stream_server=debug")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }
    if let Some(home) = args.home {
        config.paths.home = home;
    }
    config.expand_env_vars()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.listen,
        home = %config.paths.home.display(),
        "Starting streamgate"
    );

    let server = Server::bind(config).context("Failed to bind server")?;
    server.serve().context("Server loop failed")?;
    Ok(())
}

fn init_logging(args: &Args) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if args.json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
