use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use hatchery_sdk::{
    DriverError, JobId, ModelId, ModelType, Requirement, SpawnArguments, SpawnDriver, WorkerModel,
    WorkerRecord,
};

/// In-memory spawn driver.
///
/// Spawned instances are added to the started list under their worker name.
pub struct FakeDriver {
    model_type: ModelType,
    started: Mutex<Vec<String>>,
    spawned: Mutex<Vec<SpawnArguments>>,
    killed: Mutex<Vec<String>>,
    failing_models: Mutex<HashSet<ModelId>>,
    refused_models: Mutex<HashSet<ModelId>>,
    fail_all: AtomicBool,
    spawn_delay: Duration,

    in_progress: AtomicUsize,
    max_in_progress: AtomicUsize,
}

impl FakeDriver {
    pub fn new(model_type: ModelType) -> Self {
        Self {
            model_type,
            started: Mutex::new(Vec::new()),
            spawned: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            failing_models: Mutex::new(HashSet::new()),
            refused_models: Mutex::new(HashSet::new()),
            fail_all: AtomicBool::new(false),
            spawn_delay: Duration::ZERO,
            in_progress: AtomicUsize::new(0),
            max_in_progress: AtomicUsize::new(0),
        }
    }

    /// Every spawn takes this long.
    pub fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = delay;
        self
    }

    pub fn with_started(self, names: &[&str]) -> Self {
        self.set_started(names);
        self
    }

    pub fn set_started(&self, names: &[&str]) {
        *self.started.lock().unwrap() = names.iter().map(|n| n.to_string()).collect();
    }

    /// Spawns of this model fail.
    pub fn fail_model(&self, model_id: ModelId) {
        self.failing_models.lock().unwrap().insert(model_id);
    }

    /// `can_spawn` returns false for this model.
    pub fn refuse_model(&self, model_id: ModelId) {
        self.refused_models.lock().unwrap().insert(model_id);
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> Vec<SpawnArguments> {
        self.spawned.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    /// Highest number of spawns observed running at once.
    pub fn max_concurrent_spawns(&self) -> usize {
        self.max_in_progress.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpawnDriver for FakeDriver {
    fn model_type(&self) -> ModelType {
        self.model_type
    }

    fn can_spawn(
        &self,
        model: &WorkerModel,
        _job_id: Option<JobId>,
        _requirements: &[Requirement],
    ) -> bool {
        !self.refused_models.lock().unwrap().contains(&model.id)
    }

    async fn spawn_worker(&self, args: SpawnArguments) -> Result<String, DriverError> {
        let current = self.in_progress.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_progress.fetch_max(current, Ordering::SeqCst);

        if !self.spawn_delay.is_zero() {
            tokio::time::sleep(self.spawn_delay).await;
        }

        let fail = self.fail_all.load(Ordering::SeqCst)
            || self.failing_models.lock().unwrap().contains(&args.model.id);
        let result = if fail {
            Err(DriverError::Spawn(format!(
                "cannot create instance for {}",
                args.model.name
            )))
        } else {
            self.started.lock().unwrap().push(args.worker_name.clone());
            Ok(args.worker_name.clone())
        };

        self.spawned.lock().unwrap().push(args);
        self.in_progress.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn kill_worker(&self, worker: &WorkerRecord) -> Result<(), DriverError> {
        let name = worker
            .instance_name
            .clone()
            .unwrap_or_else(|| worker.name.clone());
        self.started.lock().unwrap().retain(|n| *n != name);
        self.killed.lock().unwrap().push(name);
        Ok(())
    }

    async fn workers_started(&self) -> Result<Vec<String>, DriverError> {
        Ok(self.started.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model;

    #[tokio::test]
    async fn test_workers_started_by_model_counts_both_name_forms() {
        let driver = FakeDriver::new(ModelType::Docker).with_started(&[
            "golang-abcd1234",
            "register-golang-efgh5678",
            "golang-extra-abcd1234",
            "rust-abcd1234",
            "register-rust-ijkl9012",
        ]);

        let golang = model(1, "golang", ModelType::Docker);
        let rust = model(2, "rust", ModelType::Docker);
        let node = model(3, "node", ModelType::Docker);

        assert_eq!(driver.workers_started_by_model(&golang).await.unwrap(), 2);
        assert_eq!(driver.workers_started_by_model(&rust).await.unwrap(), 2);
        assert_eq!(driver.workers_started_by_model(&node).await.unwrap(), 0);
    }
}
