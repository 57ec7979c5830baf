//! Signaling server binary entry point
//!
//! Runs the WebSocket call relay.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: 0.0.0.0:5000, broadcast routing
//! cargo run -p callrelay-server
//!
//! # Addressed routing behind a browser app on localhost:3000
//! cargo run -p callrelay-server -- \
//!   --policy addressed \
//!   --allowed-origins http://localhost:3000
//!
//! # TOML config file, JSON logs
//! cargo run -p callrelay-server -- --config relay.toml --log-format json
//! ```
//!
//! Precedence: built-in defaults, then `--config`, then environment
//! variables (`PORT`, `RELAY_*`), then command-line flags.

use anyhow::Context;
use callrelay_core::{RelayConfig, RoutingPolicy};
use callrelay_websocket::WebSocketSignalingServer;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Call relay signaling server
///
/// Relays WebRTC offers, answers and ICE candidates between connected peers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long)]
    port: Option<u16>,

    /// Offer routing policy
    #[arg(long)]
    policy: Option<RoutingPolicy>,

    /// Maximum concurrent peers (0 = unlimited)
    #[arg(long)]
    max_peers: Option<usize>,

    /// Allowed WebSocket origins (comma-separated)
    #[arg(long, value_delimiter = ',')]
    allowed_origins: Option<Vec<String>>,

    /// Log output format
    #[arg(long, default_value = "text", env = "RELAY_LOG_FORMAT")]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(1);
        }
        eprintln!("\nCtrl+C received, shutting down...");
    })
    .context("failed to set Ctrl+C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("relay-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(args: Args, shutdown_flag: Arc<AtomicBool>) -> anyhow::Result<()> {
    init_tracing(args.log_format)?;

    let mut config = RelayConfig::load(args.config.as_ref())
        .context("failed to load configuration")?;
    apply_args(&mut config, &args);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        policy = %config.relay.routing_policy,
        max_peers = config.relay.max_peers,
        allowed_origins = ?config.server.allowed_origins,
        "Call relay signaling server starting"
    );

    let server = WebSocketSignalingServer::new(config).context("invalid configuration")?;
    let handle = server.start().await.context("failed to start server")?;

    info!("Server running on ws://{}. Press Ctrl+C to shutdown.", handle.local_addr());

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    info!("Shutdown signal received, cleaning up...");
    handle.shutdown().await;
    info!("Signaling server shut down gracefully");

    Ok(())
}

/// Command-line flags override file and environment settings
fn apply_args(config: &mut RelayConfig, args: &Args) {
    if let Some(host) = &args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(policy) = args.policy {
        config.relay.routing_policy = policy;
    }
    if let Some(max_peers) = args.max_peers {
        config.relay.max_peers = max_peers;
    }
    if let Some(origins) = &args.allowed_origins {
        config.server.allowed_origins = origins.clone();
    }
}

fn init_tracing(format: LogFormat) -> anyhow::Result<()> {
    // RUST_LOG overrides the default level
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .context("invalid log filter")?;

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init()?,
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()?,
    }
    Ok(())
}
