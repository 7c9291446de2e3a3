//! Local process driver.
//!
//! Serves `host` models: the model image is a command line, started as a
//! child process with the worker credentials in its environment. Children
//! are killed when the driver is dropped.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use hatchery_sdk::{
    DriverError, JobId, ModelType, Requirement, SpawnArguments, SpawnDriver, WorkerModel,
    WorkerRecord,
};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Spawns workers as local child processes.
pub struct ProcessDriver {
    api_url: String,
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessDriver {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn children(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Child>>, DriverError> {
        self.children
            .lock()
            .map_err(|_| DriverError::Unavailable("process table poisoned".to_string()))
    }
}

#[async_trait]
impl SpawnDriver for ProcessDriver {
    fn model_type(&self) -> ModelType {
        ModelType::Host
    }

    fn can_spawn(
        &self,
        model: &WorkerModel,
        _job_id: Option<JobId>,
        _requirements: &[Requirement],
    ) -> bool {
        !model.image.trim().is_empty()
    }

    async fn spawn_worker(&self, args: SpawnArguments) -> Result<String, DriverError> {
        let mut parts = args.model.image.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| DriverError::Spawn(format!("model {} has no command", args.model.name)))?;

        let mut command = Command::new(program);
        command
            .args(parts)
            .env("HATCHERY_WORKER_NAME", &args.worker_name)
            .env("HATCHERY_WORKER_TOKEN", &args.worker_token)
            .env("HATCHERY_WORKER_MODEL", &args.model.name)
            .env("HATCHERY_API_URL", &self.api_url)
            .env("HATCHERY_NAME", &args.hatchery_name)
            .env("HATCHERY_REGISTER_ONLY", args.register_only.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(job_id) = args.job_id {
            command.env("HATCHERY_JOB_ID", job_id.to_string());
        }

        let child = command
            .spawn()
            .map_err(|e| DriverError::Spawn(format!("{program}: {e}")))?;

        info!(
            worker = %args.worker_name,
            pid = child.id().unwrap_or_default(),
            "Worker process started"
        );
        self.children()?.insert(args.worker_name.clone(), child);
        Ok(args.worker_name)
    }

    async fn kill_worker(&self, worker: &WorkerRecord) -> Result<(), DriverError> {
        let name = worker.instance_name.as_deref().unwrap_or(&worker.name);
        let child = self.children()?.remove(name);

        match child {
            Some(mut child) => {
                child
                    .kill()
                    .await
                    .map_err(|e| DriverError::Kill(format!("{name}: {e}")))?;
                info!(worker = %name, "Worker process killed");
            }
            None => debug!(worker = %name, "Worker process already gone"),
        }
        Ok(())
    }

    async fn workers_started(&self) -> Result<Vec<String>, DriverError> {
        let mut children = self.children()?;
        children.retain(|name, child| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(worker = %name, %status, "Worker process exited");
                false
            }
            Err(e) => {
                warn!(worker = %name, error = %e, "Cannot poll worker process");
                false
            }
        });

        let mut names: Vec<String> = children.keys().cloned().collect();
        names.sort();
        Ok(names)
    }
}
