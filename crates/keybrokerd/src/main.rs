//! keybrokerd — the keybroker daemon.
//!
//! Single binary that serves the broker API and carries the offline
//! maintenance commands for its store.
//!
//! # Usage
//!
//! ```text
//! keybrokerd serve --config /etc/keybroker/keybroker.toml
//! keybrokerd migrate --config /etc/keybroker/keybroker.toml
//! keybrokerd reconcile --config /etc/keybroker/keybroker.toml --purge
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use keybroker_api::{ApiState, BasicCredentials};
use keybroker_core::BrokerConfig;
use keybroker_engine::{EngineSettings, StoreEngine};
use keybroker_state::StateStore;

#[derive(Parser)]
#[command(name = "keybrokerd", about = "keybroker service broker daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the broker API.
    Serve {
        /// Path to the broker config file.
        #[arg(long, default_value = "/etc/keybroker/keybroker.toml")]
        config: PathBuf,
    },

    /// Create the store and its tables if absent.
    Migrate {
        #[arg(long, default_value = "/etc/keybroker/keybroker.toml")]
        config: PathBuf,
    },

    /// Report keyspaces and users no record refers to. Run with the broker
    /// stopped.
    Reconcile {
        #[arg(long, default_value = "/etc/keybroker/keybroker.toml")]
        config: PathBuf,

        /// Drop what was found instead of only reporting it.
        #[arg(long)]
        purge: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,keybroker=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config } => run_serve(&load_config(&config)?).await,
        Command::Migrate { config } => run_migrate(&load_config(&config)?),
        Command::Reconcile { config, purge } => run_reconcile(&load_config(&config)?, purge),
    }
}

fn load_config(path: &Path) -> anyhow::Result<BrokerConfig> {
    let config = BrokerConfig::from_file(path)?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    info!(path = %path.display(), "config loaded");
    Ok(config)
}

fn open_store(config: &BrokerConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.store.data_dir).with_context(|| {
        format!("creating data dir {}", config.store.data_dir.display())
    })?;
    let db_path = config.store.db_path();
    let store = StateStore::open(&db_path)
        .with_context(|| format!("opening store {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

async fn run_serve(config: &BrokerConfig) -> anyhow::Result<()> {
    info!("keybroker daemon starting");

    // Refuse to serve if credentials can't be generated.
    keybroker_core::random::probe().context("entropy source unavailable")?;

    let store = open_store(config)?;
    let settings = EngineSettings::from_config(&config.store);
    info!(
        timeout = ?settings.timeout,
        replication_factor = settings.replication.replication_factor,
        "provisioning engine initialized"
    );
    let engine = StoreEngine::for_store(store, settings);

    // ── Shutdown signals ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fatal_tx, mut fatal_rx) = watch::channel(false);

    let state = ApiState {
        engine: Arc::new(engine),
        catalog: Arc::new(config.catalog.clone()),
        endpoint: Arc::new(config.store.endpoint()),
        shutdown: shutdown_rx,
        fatal: Arc::new(fatal_tx),
    };
    let credentials = BasicCredentials::new(&config.broker.username, &config.broker.password);

    // ── Start API server ───────────────────────────────────────

    let router = keybroker_api::build_router(state, credentials);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.broker.port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    let mut fault_seen = fatal_rx.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => info!("shutdown signal received"),
                Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
            },
            _ = fatal_rx.wait_for(|fatal| *fatal) => {
                error!("unrecoverable fault, shutting down");
            }
        }
        // Cancel in-flight operations.
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    if *fault_seen.borrow_and_update() {
        anyhow::bail!("stopped after an unrecoverable fault");
    }
    info!("keybroker daemon stopped");
    Ok(())
}

fn run_migrate(config: &BrokerConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let summary = store.summary()?;
    info!(
        keyspaces = summary.keyspaces,
        roles = summary.roles,
        grants = summary.grants,
        instances = summary.instances,
        bindings = summary.bindings,
        "store schema up to date"
    );
    Ok(())
}

fn run_reconcile(config: &BrokerConfig, purge: bool) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let report = keybroker_engine::find_orphans(&store)?;

    if report.is_empty() {
        info!("no orphans found");
        return Ok(());
    }

    for keyspace in &report.keyspaces {
        warn!(%keyspace, "keyspace has no instance record");
    }
    for role in &report.roles {
        warn!(%role, "user has no binding record");
    }
    for binding_id in &report.bindings {
        warn!(%binding_id, "binding refers to a missing instance");
    }

    if purge {
        let removed = keybroker_engine::purge_orphans(&store, &report)?;
        info!(found = report.total(), removed, "orphans purged");
    } else {
        info!(found = report.total(), "rerun with --purge to remove");
    }
    Ok(())
}
