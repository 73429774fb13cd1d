//! graphvault daemon entry point
//!
//! Wires a filesystem blob store to in-memory graph/relational stores,
//! bootstraps from the latest full backup when the stores are empty, and
//! runs the backup worker until interrupted.

use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use graphvault::{
    BackupConfig, BackupRepository, BackupWorker, FsBlobStore, GraphSession, MemoryGraph,
    MemoryRelational, RelationalSession, RestoreEngine,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    if std::env::args().any(|a| a == "--help" || a == "-h") {
        graphvault::config::print_env_help();
        return Ok(());
    }

    let config = BackupConfig::from_env();
    config.log();
    config.validate()?;

    let store = Arc::new(FsBlobStore::new(&config.data_dir)?);
    let repository = Arc::new(BackupRepository::new(store, config.prefix.clone()));
    let graph: Arc<dyn GraphSession> = Arc::new(MemoryGraph::new());
    let relational: Arc<dyn RelationalSession> = Arc::new(MemoryRelational::new());

    let restore = RestoreEngine::new(
        Arc::clone(&repository),
        Arc::clone(&graph),
        Arc::clone(&relational),
    );
    match restore.initialize_from_latest_backup().await {
        Ok(Some(summary)) => info!(
            key = %summary.backup_key,
            nodes = summary.nodes_restored,
            users = summary.users_created,
            "Bootstrapped from latest backup"
        ),
        Ok(None) => {}
        Err(e) => error!(error = %e, "Bootstrap from latest backup failed"),
    }

    let worker = BackupWorker::new(config, repository, graph, relational)?;
    worker.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    worker.stop().await;

    Ok(())
}
