//! CSF Coordinator daemon entry point.
//!
//! Loads configuration, wires the control plane against the in-memory
//! metadata store, starts the queue workers and periodic loops, and runs
//! until ctrl-c. The transport that accepts device connections and the
//! HTTP surface are separate services; this process is the control plane
//! only.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, Level};

use csf_coordinator::{Coordinator, ShutdownSignal};
use csf_meta::MemoryMetaStore;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let mut config = csf_common::config::load_from_file(&cli.config)?;
    if let Some(dir) = cli.staging_dir {
        config.staging_dir = dir;
    }
    config.validate()?;

    if cli.check_config {
        println!("configuration ok");
        return Ok(());
    }

    info!("═══════════════════════════════════════════════════════");
    info!("              CSF Coordinator starting                  ");
    info!("═══════════════════════════════════════════════════════");
    info!("redundancy factor: {}", config.redundancy_factor);
    info!("safety margin:     {}", config.safety_margin);
    info!("chunk policy:      {}", config.chunk_policy);
    info!("scan interval:     {:?}", config.scan_interval());
    info!("staging dir:       {}", config.staging_dir);

    let store = Arc::new(MemoryMetaStore::new());
    let coordinator = Arc::new(Coordinator::new(config, store)?);

    let shutdown = Arc::new(ShutdownSignal::new());
    let handles = coordinator.start(shutdown.clone());
    info!("coordinator running, press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining workers");
    shutdown.trigger();
    for handle in handles {
        let _ = handle.await;
    }
    info!("coordinator stopped");
    Ok(())
}
