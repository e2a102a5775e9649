//! Parley Relay Server
//!
//! Run with: cargo run --bin parley-server
//!
//! # Configuration
//!
//! Settings come from a TOML file (`--config`, or the default search path),
//! then environment variables, then command-line flags:
//! - `PARLEY_HOST` / `--host`: Host to bind to (default: 0.0.0.0)
//! - `PARLEY_PORT`, `PORT` / `--port`: Port to listen on (default: 3567)
//! - `MAX_CONNECTIONS_PER_IP`: Connection ceiling per address (default: 10)
//! - `AUTH_ATTEMPTS_PER_MIN`: Login attempts per address per minute (default: 5)
//! - `PARLEY_DELIVERY`: `scoped` or `global` (default: scoped)
//! - `RUST_LOG` / `PARLEY_LOG_LEVEL`: Log level (default: info)

use clap::Parser;
use parley::config::{generate_default_config, Config};
use parley::server::{serve, AppState};
use parley::store::MemoryStore;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "parley-server")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time messaging relay")]
struct Args {
    /// Config file (default: search the standard locations)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Print a commented default config file and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.print_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let mut config = parley::logging::bootstrap(|| match &args.config {
        Some(path) => Config::load_with_env(path),
        None => Ok(Config::load_default()),
    })?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    parley::logging::init(&config.logging);

    tracing::info!("Starting Parley relay v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        max_connections_per_ip = config.governor.max_connections_per_ip,
        auth_attempts_per_minute = config.governor.auth_attempts_per_minute,
        delivery = ?config.hub.delivery,
        "Relay limits"
    );

    let server_config = config.server.clone();
    let state = AppState::with_store(config, Arc::new(MemoryStore::new()));

    serve(state, &server_config).await?;

    tracing::info!("Parley relay stopped");
    Ok(())
}
