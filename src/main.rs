//! IPVS load-balancing control plane for a Docker network.

use std::sync::Arc;

use anyhow::Context;
use log::{error, info};
use tokio::signal;
use tokio::sync::{mpsc, watch};

mod config;
mod dispatch;
mod error;
mod exec;
mod orchestrator;
mod pool;
mod real_server;
mod registry;
mod runtime;
mod service;
mod types;

use config::Config;
use exec::ShellRunner;
use orchestrator::Orchestrator;
use runtime::{ContainerRuntime, DockerRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cfg = Config::load()?;
    let network = cfg
        .network_name
        .clone()
        .context("no network to manage; pass a network name or set IPVSNET_NETWORK_NAME")?;
    let self_id = cfg
        .self_id
        .clone()
        .context("cannot determine own container; pass a self id or set HOSTNAME")?;
    info!("Starting ipvsnet daemon for network {}", network);

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::new(network)?);
    let exec = Arc::new(ShellRunner);

    // The watcher starts before reconciliation so no event slips
    // between the initial scan and the subscription; replays of
    // containers seen by both are absorbed by idempotent handling.
    let (event_tx, event_rx) = mpsc::channel(128);
    let watcher = Arc::clone(&runtime);
    let watcher_handle = tokio::spawn(async move {
        if let Err(e) = watcher.watch(event_tx).await {
            error!("Container runtime failed: {}", e);
        }
    });

    let orchestrator = Orchestrator::bootstrap(&self_id, &cfg, Arc::clone(&runtime), exec).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loop_handle = tokio::spawn(orchestrator.run(event_rx, shutdown_rx));

    // Graceful shutdown
    tokio::select! {
        signal = signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Received Ctrl+C, shutting down..."),
                Err(err) => error!("Unable to listen for shutdown signal: {}", err),
            }
        }
        result = &mut loop_handle => {
            watcher_handle.abort();
            return result?.context("event loop terminated");
        }
    }

    // Let the loop finish the event in flight, then stop the watcher.
    let _ = shutdown_tx.send(true);
    if let Err(e) = loop_handle.await? {
        error!("Event loop failed: {}", e);
    }
    watcher_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
