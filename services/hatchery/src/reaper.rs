//! Disabled worker reaper.
//!
//! The job server disables workers it wants gone (and the pool view
//! disables inconsistent ones); the instances behind them keep running
//! until someone kills them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use hatchery_sdk::{SpawnDriver, WorkerStatus};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::pool::WorkerPool;

/// Kills instances of disabled workers.
pub struct Reaper {
    pool: WorkerPool,
    driver: Arc<dyn SpawnDriver>,
    interval: Duration,
}

impl Reaper {
    pub fn new(pool: WorkerPool, driver: Arc<dyn SpawnDriver>, interval: Duration) -> Self {
        Self {
            pool,
            driver,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting worker reaper");

        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Worker reaping failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Worker reaper shutting down");
                    break;
                }
            }
        }
    }

    /// Kill every disabled worker still started on the driver. Returns how
    /// many were killed.
    pub async fn tick(&self) -> Result<usize> {
        let disabled = self.pool.reconcile(&[WorkerStatus::Disabled]).await?;

        let mut killed = 0;
        for worker in disabled.iter().filter(|w| w.instance_name.is_some()) {
            match self.driver.kill_worker(worker).await {
                Ok(()) => {
                    info!(worker = %worker.name, "Killed disabled worker");
                    killed += 1;
                }
                Err(e) => {
                    warn!(worker = %worker.name, error = %e, "Cannot kill disabled worker");
                }
            }
        }
        Ok(killed)
    }
}
