//! spotgridd — the spotgrid daemon.
//!
//! Single binary that assembles the engine:
//! - State store (redb)
//! - Ingestion validator
//! - Pricing consolidator (periodic + catch-up)
//! - Decision gateway with the configured provider
//! - Command queue + expiry sweeper
//! - Emergency failover orchestrator + zombie reaper
//! - REST API
//!
//! # Usage
//!
//! ```text
//! spotgridd run --port 8470 --data-dir /var/lib/spotgrid --config /etc/spotgrid.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use spotgrid_api::{ApiState, build_router};
use spotgrid_decision::DecisionGateway;
use spotgrid_failover::{FailoverOrchestrator, LogNotifier, ZombieReaper};
use spotgrid_ingest::IngestValidator;
use spotgrid_pricing::Consolidator;
use spotgrid_queue::CommandQueue;
use spotgrid_state::{EngineConfig, StateStore};

#[derive(Parser)]
#[command(name = "spotgridd", about = "spotgrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane (API server + background tasks).
    Run {
        /// Port to listen on.
        #[arg(long, default_value = "8470")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/spotgrid")]
        data_dir: PathBuf,

        /// Optional TOML config file; missing keys use defaults.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,spotgridd=debug,spotgrid=debug".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            port,
            data_dir,
            config,
        } => run(port, data_dir, config.as_deref()).await,
    }
}

/// Load the engine config from disk and reconcile it with the persisted
/// copy: a changed file bumps the version so agents pull the new copy on
/// their next heartbeat.
fn sync_config(store: &StateStore, path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let mut cfg = match path {
        Some(p) => {
            let text = std::fs::read_to_string(p)?;
            toml::from_str(&text)?
        }
        None => EngineConfig::default(),
    };

    match store.get_engine_config()? {
        Some(stored) => {
            cfg.version = stored.version;
            if cfg != stored {
                cfg.version = stored.version + 1;
                store.put_engine_config(&cfg)?;
                info!(version = cfg.version, "engine config updated from file");
            } else {
                cfg = stored;
            }
        }
        None => {
            cfg.version = 1;
            store.put_engine_config(&cfg)?;
            info!(version = cfg.version, "engine config initialized");
        }
    }
    Ok(cfg)
}

async fn run(port: u16, data_dir: PathBuf, config_path: Option<&Path>) -> anyhow::Result<()> {
    info!("spotgrid daemon starting");

    // Ensure data directory exists.
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("spotgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let cfg = sync_config(&store, config_path)?;
    info!(config_version = cfg.version, "engine config loaded");

    let validator = Arc::new(IngestValidator::new(cfg.ingest.clone()));

    let queue = CommandQueue::new(store.clone(), cfg.failover.command_expiry_secs);

    let gateway = Arc::new(DecisionGateway::new(store.clone(), &cfg.decision));
    info!(provider = %cfg.decision.provider, "decision gateway initialized");

    let orchestrator = Arc::new(FailoverOrchestrator::new(
        store.clone(),
        queue.clone(),
        (&cfg.failover).into(),
        Arc::new(LogNotifier),
    ));

    let consolidator = Consolidator::new(store.clone(), cfg.pricing.clone());
    let reaper = ZombieReaper::new(store.clone(), queue.clone());

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consolidator_shutdown = shutdown_rx.clone();
    let sweeper_shutdown = shutdown_rx.clone();
    let reaper_shutdown = shutdown_rx.clone();

    // ── Start background tasks ─────────────────────────────────

    let consolidation_interval = Duration::from_secs(cfg.pricing.interval_secs);
    let consolidator_handle = tokio::spawn(async move {
        consolidator
            .run_periodic(consolidation_interval, consolidator_shutdown)
            .await;
    });

    let sweep_interval = Duration::from_secs(cfg.failover.sweep_interval_secs);
    let sweeper_queue = queue.clone();
    let sweeper_handle = tokio::spawn(async move {
        sweeper_queue.run_sweeper(sweep_interval, sweeper_shutdown).await;
    });

    let reaper_interval = Duration::from_secs(cfg.failover.reaper_interval_secs);
    let reaper_handle = tokio::spawn(async move {
        reaper.run(reaper_interval, reaper_shutdown).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = build_router(ApiState {
        store,
        validator,
        queue,
        orchestrator,
        gateway,
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install CTRL+C handler");
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    let _ = consolidator_handle.await;
    let _ = sweeper_handle.await;
    let _ = reaper_handle.await;

    info!("spotgrid daemon stopped");
    Ok(())
}
