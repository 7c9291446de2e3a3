//! Worker model registration.
//!
//! Models must be registered (a register-only worker starts, reports its
//! capabilities and exits) before they can run jobs. The scheduler
//! periodically looks for models needing it and feeds register-only
//! requests to the starter pool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hatchery_reconcile::registration_in_flight;
use hatchery_sdk::{GroupId, JobServer, ModelType, SpawnDriver, WorkerStatus};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::capacity::{CapacityGate, SpawnCounters};
use crate::pool::WorkerPool;
use crate::starter::{RegisterSpawn, SpawnQueue, SpawnRequest};

/// Periodic registration scan.
pub struct RegistrationScheduler {
    pub job_server: Arc<dyn JobServer>,
    pub driver: Arc<dyn SpawnDriver>,
    pub pool: WorkerPool,
    pub gate: CapacityGate,
    pub queue: SpawnQueue,
    pub counters: Arc<SpawnCounters>,
    pub model_type: ModelType,
    pub group_id: GroupId,
    pub frequency: Duration,
    /// Soft ceiling on models registering at once.
    pub max_registering: usize,
}

/// Outcome of one scan.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanStats {
    pub submitted: usize,
    pub skipped: usize,
}

impl RegistrationScheduler {
    /// Scan every `frequency` until shutdown.
    #[instrument(skip(self, shutdown), fields(model_type = %self.model_type))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.frequency.as_secs(),
            "Starting registration scheduler"
        );

        let mut interval = tokio::time::interval(self.frequency);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(stats) if stats.submitted > 0 => {
                            info!(submitted = stats.submitted, "Registration requests submitted");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Registration scan failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("Registration scheduler shutting down");
                    break;
                }
            }
        }
    }

    /// One scan over the worker models.
    pub async fn tick(&self) -> Result<ScanStats> {
        let models = self
            .job_server
            .list_worker_models()
            .await
            .context("listing worker models")?;
        let in_progress = self
            .pool
            .reconcile(&[WorkerStatus::Registering, WorkerStatus::Pending])
            .await?;

        let mut stats = ScanStats::default();

        for model in models.into_iter().filter(|m| m.model_type == self.model_type) {
            if model.is_poisoned_for(self.group_id) {
                debug!(model = %model.name, nb_spawn_err = model.nb_spawn_err, "Skipping poisoned model");
                stats.skipped += 1;
                continue;
            }

            if registration_in_flight(&in_progress, &model.name) {
                debug!(model = %model.name, "Registration already in progress");
                stats.skipped += 1;
                continue;
            }

            if !self.driver.need_registration(&model) && !model.check_registration {
                continue;
            }

            if !self.gate.can_admit_more().await {
                debug!("No capacity left for registration");
                break;
            }

            let Some(slot) = self.counters.try_start_registration(self.max_registering) else {
                debug!(
                    registering = self.counters.registering(),
                    max_registering = self.max_registering,
                    "Too many models registering"
                );
                break;
            };

            if let Err(e) = self.job_server.book_model_for_registration(model.id).await {
                debug!(model = %model.name, error = %e, "Cannot book model for registration");
                stats.skipped += 1;
                continue;
            }

            let name = model.name.clone();
            let request = SpawnRequest::Register(RegisterSpawn {
                model,
                slot: Some(slot),
            });
            if let Err(e) = self.queue.submit(request).await {
                warn!(model = %name, error = %e, "Cannot submit registration request");
                break;
            }

            debug!(model = %name, "Registration request submitted");
            stats.submitted += 1;
        }

        Ok(stats)
    }
}
