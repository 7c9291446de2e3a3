//! Collaborator interfaces consumed by the engine.
//!
//! - [`JobServer`]: the authoritative job server (booking, spawn info, workers, models)
//! - [`SpawnDriver`]: one implementation per backend, creates and destroys instances

use async_trait::async_trait;

use crate::error::{DriverError, JobServerError};
use crate::names;
use crate::types::{
    HatcheryId, HatcheryIdentity, JobId, ModelId, ModelType, RegisteredWorker, Requirement,
    SpawnArguments, SpawnInfo, WorkerId, WorkerModel, WorkerRecord,
};

/// Job server calls the engine depends on.
#[async_trait]
pub trait JobServer: Send + Sync {
    /// Workers registered by this hatchery.
    async fn list_registered_workers(&self) -> Result<Vec<RegisteredWorker>, JobServerError>;

    /// Worker models visible to this hatchery.
    async fn list_worker_models(&self) -> Result<Vec<WorkerModel>, JobServerError>;

    /// Atomically claim a job. Fails with `Conflict` when already booked.
    async fn book_job(&self, job_id: JobId) -> Result<(), JobServerError>;

    /// Claim a model for registration. Fails with `Conflict` when another hatchery has it.
    async fn book_model_for_registration(&self, model_id: ModelId) -> Result<(), JobServerError>;

    /// Attach spawn messages to a job.
    async fn send_spawn_info(&self, job_id: JobId, infos: &[SpawnInfo])
        -> Result<(), JobServerError>;

    /// Record a spawn failure against a model.
    async fn report_model_spawn_error(
        &self,
        model_id: ModelId,
        message: &str,
    ) -> Result<(), JobServerError>;

    /// Mark a worker as disabled so that nothing gets scheduled on it.
    async fn disable_worker(&self, worker_id: WorkerId) -> Result<(), JobServerError>;

    /// Register the hatchery. Returns the stored identity and whether the
    /// hatchery version is up to date.
    async fn register_hatchery(
        &self,
        identity: &HatcheryIdentity,
    ) -> Result<(HatcheryIdentity, bool), JobServerError>;

    /// Keep the registration alive.
    async fn refresh_hatchery(&self, id: HatcheryId) -> Result<(), JobServerError>;
}

/// Backend-specific instance lifecycle.
///
/// The engine never branches on the backend; everything it needs to know
/// goes through this trait.
#[async_trait]
pub trait SpawnDriver: Send + Sync {
    /// Backend family served by this driver.
    fn model_type(&self) -> ModelType;

    /// Driver-local admission check (resources, image availability...).
    fn can_spawn(&self, model: &WorkerModel, job_id: Option<JobId>, requirements: &[Requirement])
        -> bool;

    /// Whether the model must be registered again before running jobs.
    fn need_registration(&self, model: &WorkerModel) -> bool {
        model.need_registration || model.registration_outdated()
    }

    /// Create one instance. Returns the instance name.
    async fn spawn_worker(&self, args: SpawnArguments) -> Result<String, DriverError>;

    /// Destroy an instance.
    async fn kill_worker(&self, worker: &WorkerRecord) -> Result<(), DriverError>;

    /// Names of the instances currently started on the backend.
    async fn workers_started(&self) -> Result<Vec<String>, DriverError>;

    /// Number of started instances spawned from a model.
    async fn workers_started_by_model(&self, model: &WorkerModel) -> Result<usize, DriverError> {
        let started = self.workers_started().await?;
        Ok(started
            .iter()
            .filter(|name| names::belongs_to_model(names::parse_instance_name(name).0, &model.name))
            .count())
    }
}
