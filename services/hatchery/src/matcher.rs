//! Requirement matching between jobs and worker models.
//!
//! Rules are evaluated in order and the first failing rule wins. Matching
//! has no side effects and takes no locks, so starter workers and the
//! dispatcher call it concurrently.

use std::sync::Arc;

use hatchery_sdk::{
    GroupId, JobId, ModelType, Requirement, RequirementKind, SpawnDriver, WorkerModel,
};

/// Why a model cannot run a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mismatch {
    /// Model built for another backend.
    WrongBackend(ModelType),
    /// Too many spawn errors on a model owned by another group.
    Poisoned,
    /// Model group not allowed to execute the job.
    GroupNotAllowed,
    /// `model` requirement names another model.
    ModelName(String),
    /// `hostname` requirement names another host.
    Hostname(String),
    /// Requirement kind this backend cannot provide.
    Unsupported(RequirementKind),
    /// `os-architecture` differs from the registered one.
    OsArch { required: String, registered: String },
    /// Binary not among the registered capabilities.
    MissingBinary(String),
    /// Model must be registered before running jobs.
    NeedsRegistration,
    /// The driver refused the model.
    DriverRefused,
}

/// Matches job requirements against worker models for one hatchery.
#[derive(Clone)]
pub struct Matcher {
    model_type: ModelType,
    group_id: GroupId,
    driver: Arc<dyn SpawnDriver>,
}

impl Matcher {
    pub fn new(model_type: ModelType, group_id: GroupId, driver: Arc<dyn SpawnDriver>) -> Self {
        Self {
            model_type,
            group_id,
            driver,
        }
    }

    /// Whether `model` can run a job with these requirements.
    pub fn can_run_job(
        &self,
        model: &WorkerModel,
        job_id: Option<JobId>,
        requirements: &[Requirement],
        hostname: &str,
        exec_groups: &[GroupId],
    ) -> bool {
        self.check(model, job_id, requirements, hostname, exec_groups)
            .is_ok()
    }

    /// Same as [`Matcher::can_run_job`], reporting the first failing rule.
    pub fn check(
        &self,
        model: &WorkerModel,
        job_id: Option<JobId>,
        requirements: &[Requirement],
        hostname: &str,
        exec_groups: &[GroupId],
    ) -> Result<(), Mismatch> {
        if model.model_type != self.model_type {
            return Err(Mismatch::WrongBackend(model.model_type));
        }

        if model.is_poisoned_for(self.group_id) {
            return Err(Mismatch::Poisoned);
        }

        if !exec_groups.is_empty() && !exec_groups.contains(&model.group_id) {
            return Err(Mismatch::GroupNotAllowed);
        }

        let mut pinned = false;
        for req in requirements {
            match req.kind {
                RequirementKind::Model => {
                    pinned = true;
                    if req.value_without_options() != model.name {
                        return Err(Mismatch::ModelName(req.value.clone()));
                    }
                }
                RequirementKind::Hostname => {
                    pinned = true;
                    if req.value != hostname {
                        return Err(Mismatch::Hostname(req.value.clone()));
                    }
                }
                RequirementKind::Service | RequirementKind::Memory => {
                    if !self.model_type.is_container_capable() {
                        return Err(Mismatch::Unsupported(req.kind));
                    }
                }
                RequirementKind::OsArch => {
                    if let Some(registered) = model.registered_os_arch() {
                        if registered != req.value {
                            return Err(Mismatch::OsArch {
                                required: req.value.clone(),
                                registered,
                            });
                        }
                    }
                }
                // Cannot be verified before the worker runs.
                RequirementKind::Network | RequirementKind::Plugin | RequirementKind::Unknown => {}
                RequirementKind::Binary => {}
            }
        }

        // A pinned model or host is trusted to carry its binaries.
        if !pinned {
            for req in requirements.iter().filter(|r| r.kind == RequirementKind::Binary) {
                let found = model
                    .registered_capabilities
                    .iter()
                    .any(|cap| cap.value == req.value || cap.name == req.value);
                if !found {
                    return Err(Mismatch::MissingBinary(req.value.clone()));
                }
            }
        }

        if model.need_registration {
            return Err(Mismatch::NeedsRegistration);
        }

        if !self.driver.can_spawn(model, job_id, requirements) {
            return Err(Mismatch::DriverRefused);
        }

        Ok(())
    }
}
