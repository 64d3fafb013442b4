//! Poll loop feeding desired state into the stack manager.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::client::ControlPlaneClient;
use crate::manager::StackManager;

/// Periodically fetch the desired-state snapshot and merge it into the
/// manager until shutdown.
pub async fn run_poll_loop(
    manager: StackManager,
    client: Arc<dyn ControlPlaneClient>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "starting stack poll loop");

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = match client.get_stack_summaries().await {
                    Ok(snapshot) => snapshot,
                    Err(e) => {
                        warn!(error = %e, "unable to fetch stack summaries, will retry");
                        continue;
                    }
                };

                if let Err(e) = manager.update_stacks_status(snapshot).await {
                    error!(error = %e, "stack intake failed");
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("poll loop shutting down");
                    return;
                }
            }
        }
    }
}
