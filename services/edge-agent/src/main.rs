//! Edge agent.
//!
//! Long-running agent that reconciles application stacks declared by a
//! remote control plane onto the local orchestration engine.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use edge_agent::client::{ControlPlaneClient, HttpControlPlaneClient};
use edge_agent::config::{Config, ManagerConfig};
use edge_agent::manager::StackManager;
use edge_agent::poll;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        edge_id = %config.edge_id,
        control_plane_url = %config.control_plane_url,
        engine = %config.engine,
        "starting edge agent"
    );

    let client: Arc<dyn ControlPlaneClient> = Arc::new(HttpControlPlaneClient::new(&config)?);
    let manager = StackManager::new(
        client.clone(),
        config.data_dir.clone(),
        config.edge_id.clone(),
        ManagerConfig::default(),
    );

    manager.set_engine_type(config.engine).await?;
    manager.start().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poll_handle = tokio::spawn(poll::run_poll_loop(
        manager.clone(),
        client,
        config.poll_interval,
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    manager.stop().await;
    poll_handle.await?;

    Ok(())
}
