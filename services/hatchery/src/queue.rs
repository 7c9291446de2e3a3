//! Job queue poller.
//!
//! Feeds the dispatcher intake with the jobs currently waiting on the job
//! server. Jobs are re-sent on every poll; the dispatcher filters the ones
//! it already handled.

use std::sync::Arc;
use std::time::Duration;

use hatchery_sdk::Job;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, instrument, warn};

use crate::client::HttpJobServer;

/// Periodically lists pending jobs.
pub struct QueuePoller {
    client: Arc<HttpJobServer>,
    jobs: mpsc::Sender<Job>,
    interval: Duration,
}

impl QueuePoller {
    pub fn new(client: Arc<HttpJobServer>, jobs: mpsc::Sender<Job>, interval: Duration) -> Self {
        Self {
            client,
            jobs,
            interval,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "Starting queue poller");

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if !self.poll().await {
                        info!("Job intake closed, queue poller stopping");
                        break;
                    }
                }
                _ = shutdown.changed() => {
                    info!("Queue poller shutting down");
                    break;
                }
            }
        }
    }

    /// One poll. Returns false once the intake is closed.
    pub async fn poll(&self) -> bool {
        let jobs = match self.client.list_pending_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Cannot list pending jobs");
                return true;
            }
        };

        debug!(count = jobs.len(), "Pending jobs fetched");
        for job in jobs {
            if self.jobs.send(job).await.is_err() {
                return false;
            }
        }
        true
    }
}
