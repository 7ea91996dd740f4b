use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stateroom::auth::MemoryAuthStore;
use stateroom::config::Config;
use stateroom::demo::DemoApp;
use stateroom::pool::{DbPool, NullConnector};
use stateroom::render::HtmlRenderer;
use stateroom::server::{self, AppState, Services};
use stateroom::session::{ReapParams, SessionRegistry, registry::spawn_sweeper};

// ============================================================================
// CLI Types
// ============================================================================

/// Stateroom - a server-side stateful application runtime
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "stateroom.yaml")]
        config: String,

        /// Host to bind to (overrides config file)
        #[arg(long)]
        host: Option<IpAddr>,

        /// Port to listen on (overrides config file)
        #[arg(short, long)]
        port: Option<u16>,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, host, port } => serve(&config, host, port).await,
    }
}

// ============================================================================
// Serve
// ============================================================================

async fn serve(
    config_path: &str,
    host_override: Option<IpAddr>,
    port_override: Option<u16>,
) -> Result<()> {
    let mut config = Config::load(config_path).await?;

    // CLI overrides config
    if let Some(host) = host_override {
        config.server.host = host.to_string();
    }
    if let Some(port) = port_override {
        config.server.port = port;
    }

    let registry = Arc::new(SessionRegistry::new(
        ReapParams {
            min_seconds: config.sessions.reap_min_seconds,
            max_seconds: config.sessions.reap_max_seconds,
            inc_seconds: config.sessions.reap_increment_seconds,
        },
        Duration::from_secs(config.sessions.sweep_interval_seconds),
    ));
    let sweeper = spawn_sweeper(Arc::clone(&registry));

    let pool = DbPool::new(Arc::new(NullConnector));
    if let Some(db) = &config.database {
        // Pre-register the configured factory so occupancy shows up in the
        // admin surface even before the first borrow.
        pool.factory(&db.conninfo);
        warn!(
            conninfo = %db.conninfo,
            "database configured but no backend connector is compiled in"
        );
    }

    let services = Services {
        registry,
        pool,
        auth: Arc::new(MemoryAuthStore::new()),
        renderer: Arc::new(HtmlRenderer::new()),
        app: Arc::new(DemoApp),
        config: Arc::new(config),
    };
    let state = AppState {
        services: services.clone(),
    };
    let app = server::build_app(state);

    let ip: IpAddr = services.config.server.host.parse()?;
    let addr = SocketAddr::new(ip, services.config.server.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!(addr = %addr, "Starting server");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    sweeper.abort();
    info!(sessions = services.registry.len(), "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
