//! DeviceStream Server
//!
//! Run with: cargo run -- serve
//!
//! # Configuration
//!
//! Read from `--config <path>`, or the first of
//! `<config_dir>/devicestream/config.toml`, `/etc/devicestream/config.toml`
//! and `./config.toml`. Environment variables override file values:
//! - `DEVICESTREAM_HOST`, `DEVICESTREAM_PORT`
//! - `DEVICESTREAM_MAX_CONNECTIONS`, `DEVICESTREAM_MAILBOX_CAPACITY`
//! - `DEVICESTREAM_LOG_LEVEL`, `DEVICESTREAM_LOG_FORMAT`
//! - `RUST_LOG`: takes precedence over the configured log level

use anyhow::Context;
use clap::{Parser, Subcommand};
use devicestream::api::{serve, AppState};
use devicestream::config::{generate_default_config, Config, LoggingConfig};
use devicestream::websocket::{ConnectionHub, TrustedHeaderResolver};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "devicestream")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Real-time device telemetry over WebSockets")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default)
    Serve,

    /// Print a commented default config file
    InitConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::InitConfig => {
            print!("{}", generate_default_config());
            Ok(())
        }
        Commands::Serve => {
            let config = match &cli.config {
                Some(path) => Config::load_with_env(path)
                    .with_context(|| format!("loading config from {}", path.display()))?,
                None => Config::load_default().context("loading default config")?,
            };
            init_tracing(&config.logging);
            run(config).await
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!("Starting DeviceStream v{}", env!("CARGO_PKG_VERSION"));

    let hub_config = config.websocket.hub_config();
    tracing::info!(
        max_connections = hub_config.max_connections,
        mailbox_capacity = hub_config.mailbox_capacity,
        ping_interval = ?hub_config.ping_interval,
        "WebSocket hub configured"
    );

    let hub = Arc::new(ConnectionHub::new(hub_config));
    let identity = Arc::new(TrustedHeaderResolver::new(
        config.websocket.identity_header.clone(),
    ));
    let api_config = config.server.api_config();
    let state = AppState::new(Arc::clone(&hub), identity, api_config.clone());

    serve(state, &api_config)
        .await
        .context("running HTTP server")?;

    tracing::info!("DeviceStream stopped");
    Ok(())
}

/// RUST_LOG wins over the configured level
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("devicestream={},tower_http=info", logging.level).into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
