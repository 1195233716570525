//! Rebuilds the state store from orchestrator labels: once at startup and
//! on a periodic sweep thereafter.
//!
//! The sweep only ever adds records. Removing them is the reaper's and the
//! API's job; keeping the sweep additive lets multiple replicas each hold
//! their own store and converge on the same set.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::orchestrator::Orchestrator;
use crate::sandbox::StateStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Pre-populate the store before the server accepts traffic. Failure is
/// logged, not fatal: the periodic sweep will repair a partial or empty
/// store.
pub async fn run_startup_discovery(store: &StateStore, orchestrator: &dyn Orchestrator) {
    match orchestrator.discover_all().await {
        Ok(discovered) => {
            let count = discovered.len();
            for record in discovered {
                store.add(record);
            }
            info!("recovered {count} existing sandbox(es) from the orchestrator");
        }
        Err(err) => {
            warn!("failed to discover existing sandboxes at startup: {err}");
        }
    }
}

/// One additive sweep: insert every discovered record whose runtime id the
/// store does not know yet. Returns how many were added.
pub async fn sweep_once(store: &StateStore, orchestrator: &dyn Orchestrator) -> usize {
    let discovered = match orchestrator.discover_all().await {
        Ok(discovered) => discovered,
        Err(err) => {
            debug!("reconcile sweep failed to list sandboxes: {err}");
            return 0;
        }
    };

    let mut added = 0;
    for record in discovered {
        if !store.contains_runtime(&record.runtime_id) {
            store.add(record);
            added += 1;
        }
    }
    if added > 0 {
        info!("reconcile sweep recovered {added} sandbox(es)");
    }
    added
}

/// Spawn the periodic sweep. The task runs until the shutdown channel
/// flips to true.
pub fn spawn(
    store: Arc<StateStore>,
    orchestrator: Arc<dyn Orchestrator>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        // The store was just seeded by startup discovery; skip the
        // immediate first tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sweep_once(&store, orchestrator.as_ref()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("reconciler stopped");
                        return;
                    }
                }
            }
        }
    })
}
