//! gpubid daemon
//!
//! Loads (or seeds) the state document, starts the lifecycle and session-GC
//! timers, and serves the API. Exits non-zero when the store cannot be
//! loaded or the port cannot be bound.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use gpubid_api::{create_router, AppState, SessionStore};
use gpubid_core::{Clock, DaemonConfig, Document, ScheduleConfig};
use gpubid_engine::Engine;
use gpubid_store::Store;

/// Seconds between lifecycle ticks
const LIFECYCLE_INTERVAL_SECS: u64 = 60;
/// Seconds between session sweeps
const SESSION_GC_INTERVAL_SECS: u64 = 300;

/// gpubid daemon - credit-auction scheduler for a pool of shared GPUs
///
/// Flags and environment variables override the optional TOML config file.
#[derive(Parser, Debug)]
#[command(name = "gpubidd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to bind the API server
    #[arg(long)]
    address: Option<String>,

    /// Port for the API server
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// Directory holding the state document
    #[arg(long, env = "DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Optional TOML config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bearer token accepted from the GPU monitor
    #[arg(long, env = "GPU_MONITOR_TOKEN")]
    gpu_monitor_token: Option<String>,

    /// Timezone override for day boundaries and display
    #[arg(long, env = "TZ")]
    timezone: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let file_config = match &args.config {
        Some(path) => match DaemonConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                std::process::exit(1);
            }
        },
        None => DaemonConfig::default(),
    };

    let log_level = args
        .log_level
        .clone()
        .unwrap_or_else(|| file_config.logging.level.clone());
    let log_level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false);
    if file_config.logging.format.eq_ignore_ascii_case("json") {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    }
    .expect("Failed to set subscriber");

    info!("Starting gpubid daemon v{}", env!("CARGO_PKG_VERSION"));

    let address = args
        .address
        .clone()
        .unwrap_or_else(|| file_config.api.address.clone());
    let port = args.port.unwrap_or(file_config.api.port);
    let data_dir = args
        .data_dir
        .clone()
        .unwrap_or_else(|| file_config.storage.data_dir.clone());

    let store = Store::new(&data_dir);
    let doc = match store.load().await {
        Ok(Some(doc)) => doc,
        Ok(None) => {
            info!(data_dir = %data_dir.display(), "Fresh install; seeding state document");
            Engine::seed_document(Document::new(ScheduleConfig::default()))
        }
        Err(e) => {
            error!(error = %e, "Failed to load state document");
            std::process::exit(1);
        }
    };

    let tz_name = args
        .timezone
        .clone()
        .unwrap_or_else(|| doc.config.timezone.clone());
    let clock = match Clock::from_name(&tz_name) {
        Ok(clock) => clock,
        Err(e) => {
            error!(error = %e, "Invalid timezone");
            std::process::exit(1);
        }
    };

    let engine = Arc::new(Engine::new(store, clock, doc));
    if let Err(e) = engine.tick().await {
        error!(error = %e, "Initial lifecycle tick failed");
        std::process::exit(1);
    }

    let session_ttl = Duration::from_secs(engine.session_ttl_seconds().await);
    let sessions = Arc::new(SessionStore::new(session_ttl));

    if args.gpu_monitor_token.is_none() {
        warn!("GPU_MONITOR_TOKEN not set; monitor ingest disabled");
    }

    // Lifecycle timer: drives the engine directly, never the HTTP layer
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(LIFECYCLE_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(e) = engine.tick().await {
                    warn!(error = %e, "Lifecycle tick failed");
                }
            }
        });
    }

    // Session GC timer
    {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(SESSION_GC_INTERVAL_SECS));
            loop {
                interval.tick().await;
                sessions.purge_expired().await;
            }
        });
    }

    let router = create_router(AppState {
        engine,
        sessions,
        monitor_token: args.gpu_monitor_token.clone(),
    });

    let addr: SocketAddr = match format!("{}:{}", address, port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "Invalid bind address");
            std::process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, %addr, "Failed to bind");
            std::process::exit(1);
        }
    };
    info!("API server listening on {}", addr);

    if let Err(e) = axum::serve(listener, router).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
