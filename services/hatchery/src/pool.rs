//! Worker pool view.
//!
//! Fetches both worker sources afresh on every call and merges them with
//! [`hatchery_reconcile::reconcile`]. The view owns no state: both sources
//! change behind our back between calls, so nothing is cached.

use std::sync::Arc;

use anyhow::{Context, Result};
use hatchery_reconcile::{filter_by_status, reconcile};
use hatchery_sdk::{JobServer, SpawnDriver, WorkerRecord, WorkerStatus};
use tracing::{debug, error, warn};

/// Reconciled view over job server and driver.
#[derive(Clone)]
pub struct WorkerPool {
    job_server: Arc<dyn JobServer>,
    driver: Arc<dyn SpawnDriver>,
}

impl WorkerPool {
    pub fn new(job_server: Arc<dyn JobServer>, driver: Arc<dyn SpawnDriver>) -> Self {
        Self { job_server, driver }
    }

    /// Current pool, optionally restricted to some statuses (empty = all).
    ///
    /// A registered worker that is neither disabled nor started on the
    /// driver is force-disabled on the job server and left out of the pool.
    pub async fn reconcile(&self, statuses: &[WorkerStatus]) -> Result<Vec<WorkerRecord>> {
        let registered = self
            .job_server
            .list_registered_workers()
            .await
            .context("listing registered workers")?;
        let started = self
            .driver
            .workers_started()
            .await
            .context("listing started instances")?;

        let result = reconcile(&registered, &started);

        if let Some(worker) = result.correction {
            error!(
                worker = %worker.name,
                worker_id = %worker.id,
                status = %worker.status,
                "Worker registered but not started, disabling it"
            );
            if let Err(e) = self.job_server.disable_worker(worker.id).await {
                warn!(worker = %worker.name, error = %e, "Failed to disable inconsistent worker");
            }
        }

        if !result.deferred.is_empty() {
            debug!(
                count = result.deferred.len(),
                "More inconsistent workers left for the next pass"
            );
        }

        Ok(filter_by_status(result.pool, statuses))
    }
}
