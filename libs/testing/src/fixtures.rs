use chrono::{Duration, Utc};
use hatchery_sdk::{GroupId, Job, JobId, ModelId, ModelType, Requirement, WorkerModel};

/// A registered, healthy model owned by group 1.
pub fn model(id: i64, name: &str, model_type: ModelType) -> WorkerModel {
    let modified = Utc::now() - Duration::hours(1);
    WorkerModel {
        id: ModelId::new(id),
        name: name.to_string(),
        group_id: GroupId::new(1),
        model_type,
        image: format!("{name}:latest"),
        registered_capabilities: vec![],
        registered_os: None,
        registered_arch: None,
        nb_spawn_err: 0,
        last_spawn_err: None,
        last_registration: Some(modified + Duration::minutes(1)),
        user_last_modified: modified,
        need_registration: false,
        check_registration: false,
    }
}

/// A job queued long enough to be past any grace period.
pub fn job(id: i64, requirements: Vec<Requirement>) -> Job {
    Job {
        id: JobId::new(id),
        requirements,
        queued: Utc::now() - Duration::minutes(5),
        exec_groups: vec![],
        spawn_attempts: 0,
    }
}
