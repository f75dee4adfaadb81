//! # Refmesh Agent
//!
//! A standalone coordination agent: it joins the mesh as a process, emits
//! heartbeats, and runs the periodic orphan-recovery sweep so references
//! held by crashed processes are redistributed even when no application
//! process happens to be sweeping.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p refmesh-agent
//! ```
//!
//! Configuration comes from the environment (see `refmesh_core::config`);
//! a `.env` file is honored.

use refmesh_core::config::CoordinatorConfig;
use refmesh_core::orchestrator::Orchestrator;
use refmesh_core::process::Process;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "refmesh_agent=info,refmesh_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Refmesh Agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let config = CoordinatorConfig::from_env()?;
    tracing::info!(
        ttl_secs = config.ttl_secs,
        heartbeat_secs = config.heartbeat_interval_secs,
        "Configuration loaded"
    );

    let process = Arc::new(Process::start(config).await?);
    tracing::info!(pid = %process.id(), "Joined the mesh");

    let orchestrator: Orchestrator = Orchestrator::new(process);
    let shutdown = orchestrator.shutdown_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    orchestrator.run().await?;
    tracing::info!("Agent exited cleanly");

    Ok(())
}
