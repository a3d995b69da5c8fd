//! fleetd: the Fleet daemon.
//!
//! Opens the coordination store, competes for the pool lead, and while it
//! leads serves snapshot requests with the configured snapshot command.
//!
//! # Usage
//!
//! ```text
//! fleetd standalone --host-id h1 --pool default --data-dir /var/lib/fleet
//! ```

mod config;
mod snapshotter;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fleet_coord::{Connection, CoordStore, Election};
use fleet_listen::{get_host_id, new_host_leader, start, Listener, SnapshotListener};
use fleet_state::{paths, ClusterState};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::FleetConfig;
use crate::snapshotter::CommandSnapshotter;

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run against a store in this process.
    Standalone {
        /// Data directory for the coordination store.
        #[arg(long, default_value = "/var/lib/fleet")]
        data_dir: PathBuf,

        /// Identity advertised while holding the lead.
        #[arg(long)]
        host_id: String,

        /// Pool whose lead to compete for.
        #[arg(long, default_value = "default")]
        pool: String,

        /// Optional fleetd.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleet=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Standalone {
            data_dir,
            host_id,
            pool,
            config,
        } => run_standalone(&data_dir, &host_id, &pool, config.as_deref()).await,
    }
}

async fn run_standalone(
    data_dir: &Path,
    host_id: &str,
    pool: &str,
    config_path: Option<&Path>,
) -> anyhow::Result<()> {
    info!(%host_id, %pool, "fleet daemon starting");
    let config = FleetConfig::load(config_path)?;
    if config.snapshot.command.is_empty() {
        warn!("no snapshot command configured, snapshot requests will fail");
    }

    std::fs::create_dir_all(data_dir)?;
    let db_path = data_dir.join("fleet.redb");
    let store = CoordStore::open(&db_path)?;
    info!(path = ?db_path, "coordination store opened");

    let conn: Arc<dyn Connection> = Arc::new(store.connect());
    let state = ClusterState::init(conn.clone()).await?;

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to install Ctrl-C handler"),
        }
        let _ = shutdown_tx.send(true);
    });

    // ── Pool lead ──────────────────────────────────────────────

    let leader = new_host_leader(conn.clone(), host_id, &paths::pool_leader(pool)?)?;
    info!(path = %leader.path(), "waiting for pool lead");
    if leader.take_lead(&mut shutdown_rx).await? == Election::Cancelled {
        info!("stopped before acquiring the lead");
        return Ok(());
    }
    info!(leader = %get_host_id(&leader).await?, "pool lead acquired");

    // ── Snapshot service ───────────────────────────────────────

    let snapshotter = Arc::new(CommandSnapshotter::new(
        config.snapshot.command.clone(),
        config.snapshot.timeout(),
    ));
    let master: Arc<dyn Listener> = Arc::new(SnapshotListener::new(state, snapshotter));
    start(shutdown_rx, Some(master), Vec::new()).await;

    leader.release_lead().await?;
    info!("fleet daemon stopped");
    Ok(())
}
