//! Stale-job reconciliation.
//!
//! Jobs whose worker died never reach a terminal status on their own; the
//! reconciler fails them by age. It runs once at worker startup and then on a
//! fixed interval while the worker is alive.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::config::ReconcileConfig;

use super::store::{JobStore, JobStoreError};

/// Sweeps a job store for stuck jobs.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn JobStore>,
    config: ReconcileConfig,
}

/// Handle to a periodic reconciler task.
#[derive(Debug)]
#[must_use = "dropping the handle stops the periodic sweep"]
pub struct ReconcilerHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Stop the periodic sweep and wait for the task to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.join.await;
    }
}

impl Reconciler {
    pub fn new(store: Arc<dyn JobStore>, config: ReconcileConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run one sweep now. Returns the number of reclaimed jobs.
    pub async fn sweep_once(&self) -> Result<usize, JobStoreError> {
        let reclaimed = self
            .store
            .sweep(self.config.pending_ttl, self.config.running_ttl, Utc::now())
            .await?;

        if reclaimed > 0 {
            info!(reclaimed, "reclaimed stale jobs");
        } else {
            debug!("no stale jobs");
        }
        Ok(reclaimed)
    }

    /// Sweep every `sweep_interval` until the handle is shut down.
    ///
    /// The first sweep happens one interval from now; callers that want an
    /// immediate sweep call `sweep_once` first. Sweep failures are logged and
    /// retried on the next tick.
    pub fn spawn(self) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let period = self.config.sweep_interval;

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep_once().await {
                            error!(error = %e, "reconciliation sweep failed");
                        }
                    }
                }
            }
            debug!("reconciler stopped");
        });

        ReconcilerHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}
