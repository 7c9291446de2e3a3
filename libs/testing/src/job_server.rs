use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use hatchery_sdk::{
    HatcheryId, HatcheryIdentity, JobId, JobServer, JobServerError, ModelId, RegisteredWorker,
    SpawnInfo, WorkerId, WorkerModel,
};

/// A call received by [`FakeJobServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListWorkers,
    ListModels,
    BookJob(JobId),
    BookModel(ModelId),
    SpawnInfo(JobId, Vec<SpawnInfo>),
    ModelSpawnError(ModelId, String),
    DisableWorker(WorkerId),
    Register,
    Refresh(HatcheryId),
}

/// In-memory job server.
///
/// Snapshots (`workers`, `models`) only change through the setters; calls
/// such as `disable_worker` are recorded but do not mutate them.
pub struct FakeJobServer {
    workers: Mutex<Vec<RegisteredWorker>>,
    models: Mutex<Vec<WorkerModel>>,
    booked_jobs: Mutex<HashSet<JobId>>,
    booked_models: Mutex<HashSet<ModelId>>,
    calls: Mutex<Vec<Call>>,

    /// Id handed out by `register_hatchery`.
    assigned_id: AtomicI64,
    fail_register: AtomicBool,
    fail_refresh: AtomicBool,
    fail_listing: AtomicBool,
    refresh_count: AtomicU32,
}

impl FakeJobServer {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            models: Mutex::new(Vec::new()),
            booked_jobs: Mutex::new(HashSet::new()),
            booked_models: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            assigned_id: AtomicI64::new(1),
            fail_register: AtomicBool::new(false),
            fail_refresh: AtomicBool::new(false),
            fail_listing: AtomicBool::new(false),
            refresh_count: AtomicU32::new(0),
        }
    }

    pub fn with_models(self, models: Vec<WorkerModel>) -> Self {
        self.set_models(models);
        self
    }

    pub fn with_workers(self, workers: Vec<RegisteredWorker>) -> Self {
        self.set_workers(workers);
        self
    }

    pub fn set_models(&self, models: Vec<WorkerModel>) {
        *self.models.lock().unwrap() = models;
    }

    pub fn set_workers(&self, workers: Vec<RegisteredWorker>) {
        *self.workers.lock().unwrap() = workers;
    }

    /// Mark a job as already booked by someone else.
    pub fn book_elsewhere(&self, job_id: JobId) {
        self.booked_jobs.lock().unwrap().insert(job_id);
    }

    /// Mark a model as already booked for registration by someone else.
    pub fn book_model_elsewhere(&self, model_id: ModelId) {
        self.booked_models.lock().unwrap().insert(model_id);
    }

    /// Id returned by subsequent registrations. Zero simulates a broken server.
    pub fn set_assigned_id(&self, id: i64) {
        self.assigned_id.store(id, Ordering::SeqCst);
    }

    pub fn fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.fail_refresh.store(fail, Ordering::SeqCst);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    pub fn refresh_count(&self) -> u32 {
        self.refresh_count.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn disabled_workers(&self) -> Vec<WorkerId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::DisableWorker(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn booked_job_calls(&self) -> Vec<JobId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::BookJob(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn spawn_infos(&self, job_id: JobId) -> Vec<SpawnInfo> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::SpawnInfo(id, infos) if id == job_id => Some(infos),
                _ => None,
            })
            .flatten()
            .collect()
    }

    pub fn model_spawn_errors(&self) -> Vec<(ModelId, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::ModelSpawnError(id, msg) => Some((id, msg)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_listing(&self) -> Result<(), JobServerError> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(JobServerError::Transport("connection refused".to_string()));
        }
        Ok(())
    }
}

impl Default for FakeJobServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobServer for FakeJobServer {
    async fn list_registered_workers(&self) -> Result<Vec<RegisteredWorker>, JobServerError> {
        self.record(Call::ListWorkers);
        self.check_listing()?;
        Ok(self.workers.lock().unwrap().clone())
    }

    async fn list_worker_models(&self) -> Result<Vec<WorkerModel>, JobServerError> {
        self.record(Call::ListModels);
        self.check_listing()?;
        Ok(self.models.lock().unwrap().clone())
    }

    async fn book_job(&self, job_id: JobId) -> Result<(), JobServerError> {
        self.record(Call::BookJob(job_id));
        if !self.booked_jobs.lock().unwrap().insert(job_id) {
            return Err(JobServerError::Conflict(format!("job {job_id} already booked")));
        }
        Ok(())
    }

    async fn book_model_for_registration(&self, model_id: ModelId) -> Result<(), JobServerError> {
        self.record(Call::BookModel(model_id));
        if !self.booked_models.lock().unwrap().insert(model_id) {
            return Err(JobServerError::Conflict(format!(
                "model {model_id} already booked"
            )));
        }
        Ok(())
    }

    async fn send_spawn_info(
        &self,
        job_id: JobId,
        infos: &[SpawnInfo],
    ) -> Result<(), JobServerError> {
        self.record(Call::SpawnInfo(job_id, infos.to_vec()));
        Ok(())
    }

    async fn report_model_spawn_error(
        &self,
        model_id: ModelId,
        message: &str,
    ) -> Result<(), JobServerError> {
        self.record(Call::ModelSpawnError(model_id, message.to_string()));
        Ok(())
    }

    async fn disable_worker(&self, worker_id: WorkerId) -> Result<(), JobServerError> {
        self.record(Call::DisableWorker(worker_id));
        Ok(())
    }

    async fn register_hatchery(
        &self,
        identity: &HatcheryIdentity,
    ) -> Result<(HatcheryIdentity, bool), JobServerError> {
        self.record(Call::Register);
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(JobServerError::Transport("connection refused".to_string()));
        }
        let mut registered = identity.clone();
        registered.id = HatcheryId::new(self.assigned_id.load(Ordering::SeqCst));
        Ok((registered, true))
    }

    async fn refresh_hatchery(&self, id: HatcheryId) -> Result<(), JobServerError> {
        self.record(Call::Refresh(id));
        self.refresh_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(JobServerError::Status {
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}
