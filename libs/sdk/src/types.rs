//! Data model shared by the engine, the job server client and spawn drivers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::define_id;

define_id!(JobId, "job");
define_id!(ModelId, "worker model");
define_id!(WorkerId, "worker");
define_id!(GroupId, "group");
define_id!(HatcheryId, "hatchery");

/// Spawn errors tolerated on a model before hatcheries outside its group stop using it.
pub const MAX_SPAWN_ERRORS: u32 = 5;

// =============================================================================
// Requirements
// =============================================================================

/// Kind of capability a job asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequirementKind {
    Model,
    Hostname,
    Binary,
    #[serde(rename = "os-architecture")]
    OsArch,
    Network,
    Plugin,
    Service,
    Memory,
    /// Kinds introduced by newer job servers.
    #[serde(other)]
    Unknown,
}

impl RequirementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementKind::Model => "model",
            RequirementKind::Hostname => "hostname",
            RequirementKind::Binary => "binary",
            RequirementKind::OsArch => "os-architecture",
            RequirementKind::Network => "network",
            RequirementKind::Plugin => "plugin",
            RequirementKind::Service => "service",
            RequirementKind::Memory => "memory",
            RequirementKind::Unknown => "unknown",
        }
    }
}

/// A single capability required by a job or declared by a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: RequirementKind,
    pub value: String,
}

impl Requirement {
    pub fn new(kind: RequirementKind, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            value: value.into(),
        }
    }

    /// The value with trailing option tokens removed.
    ///
    /// `"golang --port=80"` yields `"golang"`.
    pub fn value_without_options(&self) -> &str {
        self.value.split_whitespace().next().unwrap_or("")
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// A pending job as delivered by the queue poller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    /// When the job entered the queue.
    pub queued: DateTime<Utc>,
    /// Groups allowed to execute the job. Empty means unrestricted.
    #[serde(default)]
    pub exec_groups: Vec<GroupId>,
    /// Spawn attempts already made for this job by any hatchery.
    #[serde(default)]
    pub spawn_attempts: u32,
}

impl Job {
    pub fn has_requirement(&self, kind: RequirementKind) -> bool {
        self.requirements.iter().any(|r| r.kind == kind)
    }
}

// =============================================================================
// Worker models
// =============================================================================

/// Backend family a worker model (and a hatchery) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Docker,
    Kubernetes,
    Host,
    Openstack,
    Vsphere,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Docker => "docker",
            ModelType::Kubernetes => "kubernetes",
            ModelType::Host => "host",
            ModelType::Openstack => "openstack",
            ModelType::Vsphere => "vsphere",
        }
    }

    /// Backends able to run service containers and enforce memory limits.
    pub fn is_container_capable(&self) -> bool {
        matches!(self, ModelType::Docker | ModelType::Kubernetes)
    }
}

impl std::fmt::Display for ModelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "docker" => Ok(ModelType::Docker),
            "kubernetes" => Ok(ModelType::Kubernetes),
            "host" => Ok(ModelType::Host),
            "openstack" => Ok(ModelType::Openstack),
            "vsphere" => Ok(ModelType::Vsphere),
            other => Err(format!("unknown model type: {other}")),
        }
    }
}

/// Template describing one spawnable worker flavor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerModel {
    pub id: ModelId,
    pub name: String,
    pub group_id: GroupId,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    /// Image, command or template reference, interpreted by the driver.
    #[serde(default)]
    pub image: String,
    /// Capabilities reported by the last register-only worker.
    #[serde(default)]
    pub registered_capabilities: Vec<Requirement>,
    #[serde(default)]
    pub registered_os: Option<String>,
    #[serde(default)]
    pub registered_arch: Option<String>,
    #[serde(default)]
    pub nb_spawn_err: u32,
    #[serde(default)]
    pub last_spawn_err: Option<String>,
    #[serde(default)]
    pub last_registration: Option<DateTime<Utc>>,
    pub user_last_modified: DateTime<Utc>,
    #[serde(default)]
    pub need_registration: bool,
    /// Force a registration check even when the model looks up to date.
    #[serde(default)]
    pub check_registration: bool,
}

impl WorkerModel {
    /// `os/arch` as registered by the last register-only worker, if both are known.
    pub fn registered_os_arch(&self) -> Option<String> {
        match (&self.registered_os, &self.registered_arch) {
            (Some(os), Some(arch)) if !os.is_empty() && !arch.is_empty() => {
                Some(format!("{os}/{arch}"))
            }
            _ => None,
        }
    }

    /// Whether the model has failed often enough to be avoided by foreign hatcheries.
    pub fn is_poisoned_for(&self, group_id: GroupId) -> bool {
        self.nb_spawn_err > MAX_SPAWN_ERRORS && self.group_id != group_id
    }

    /// Registration is stale when the model changed after its last registration.
    pub fn registration_outdated(&self) -> bool {
        match self.last_registration {
            Some(at) => at < self.user_last_modified,
            None => true,
        }
    }
}

// =============================================================================
// Workers
// =============================================================================

/// Worker status, as reported by the job server or derived locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Spawn requested on the driver, not yet registered.
    Pending,
    /// Register-only instance started on the driver.
    Registering,
    Waiting,
    Checking,
    Building,
    /// The job server wants this worker gone.
    Disabled,
}

impl WorkerStatus {
    /// Statuses counted against the worker ceiling.
    pub const ACTIVE: [WorkerStatus; 5] = [
        WorkerStatus::Checking,
        WorkerStatus::Waiting,
        WorkerStatus::Building,
        WorkerStatus::Pending,
        WorkerStatus::Registering,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Pending => "pending",
            WorkerStatus::Registering => "registering",
            WorkerStatus::Waiting => "waiting",
            WorkerStatus::Checking => "checking",
            WorkerStatus::Building => "building",
            WorkerStatus::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A worker as registered on the job server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredWorker {
    pub id: WorkerId,
    pub name: String,
    pub status: WorkerStatus,
    #[serde(default)]
    pub model_id: Option<ModelId>,
    #[serde(default)]
    pub job_id: Option<JobId>,
}

/// One entry of the reconciled worker pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerRecord {
    /// Logical worker name (without the register-only prefix).
    pub name: String,
    pub status: WorkerStatus,
    /// Set when the job server knows the worker.
    pub worker_id: Option<WorkerId>,
    /// Name as reported by the driver, when the driver runs it.
    pub instance_name: Option<String>,
}

// =============================================================================
// Hatchery
// =============================================================================

/// Registration record of a hatchery process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HatcheryIdentity {
    pub id: HatcheryId,
    pub name: String,
    pub group_id: GroupId,
    pub model_type: ModelType,
    #[serde(default)]
    pub shared_infra: bool,
    /// Base64 ed25519 verifying key for worker tokens.
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub version: String,
}

// =============================================================================
// Spawn
// =============================================================================

/// Everything a driver needs to start one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnArguments {
    pub worker_name: String,
    pub worker_token: String,
    pub model: WorkerModel,
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    pub register_only: bool,
    pub hatchery_name: String,
}

/// Identifier of a spawn message template understood by the job server UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMsgId {
    HatcheryStarts,
    HatcheryStartsSuccessfully,
    HatcheryErrorSpawn,
    HatcheryTooManyAttempts,
}

/// A templated spawn message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnMsg {
    pub id: SpawnMsgId,
    #[serde(default)]
    pub args: Vec<String>,
}

impl SpawnMsg {
    pub fn new(id: SpawnMsgId, args: Vec<String>) -> Self {
        Self { id, args }
    }

    fn arg(&self, i: usize) -> &str {
        self.args.get(i).map(String::as_str).unwrap_or("?")
    }
}

impl std::fmt::Display for SpawnMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.id {
            SpawnMsgId::HatcheryStarts => write!(
                f,
                "Hatchery {} starts worker with model {}",
                self.arg(0),
                self.arg(1)
            ),
            SpawnMsgId::HatcheryStartsSuccessfully => write!(
                f,
                "Hatchery {} started worker {} in {}",
                self.arg(0),
                self.arg(1),
                self.arg(2)
            ),
            SpawnMsgId::HatcheryErrorSpawn => write!(
                f,
                "Hatchery {} cannot spawn worker with model {} after {}: {}",
                self.arg(0),
                self.arg(1),
                self.arg(2),
                self.arg(3)
            ),
            SpawnMsgId::HatcheryTooManyAttempts => write!(
                f,
                "Hatchery {} gives up on job after {} spawn attempts",
                self.arg(0),
                self.arg(1)
            ),
        }
    }
}

/// Timestamped spawn message attached to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnInfo {
    pub api_time: DateTime<Utc>,
    pub message: SpawnMsg,
}

impl SpawnInfo {
    pub fn now(id: SpawnMsgId, args: Vec<String>) -> Self {
        Self {
            api_time: Utc::now(),
            message: SpawnMsg::new(id, args),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> WorkerModel {
        WorkerModel {
            id: ModelId::new(1),
            name: "golang".to_string(),
            group_id: GroupId::new(7),
            model_type: ModelType::Docker,
            image: "golang:1.22".to_string(),
            registered_capabilities: vec![],
            registered_os: None,
            registered_arch: None,
            nb_spawn_err: 0,
            last_spawn_err: None,
            last_registration: None,
            user_last_modified: Utc::now(),
            need_registration: false,
            check_registration: false,
        }
    }

    #[test]
    fn test_requirement_kind_wire_names() {
        let req: Requirement =
            serde_json::from_str(r#"{"name":"os","type":"os-architecture","value":"linux/amd64"}"#)
                .unwrap();
        assert_eq!(req.kind, RequirementKind::OsArch);

        let req: Requirement =
            serde_json::from_str(r#"{"name":"x","type":"volume","value":"y"}"#).unwrap();
        assert_eq!(req.kind, RequirementKind::Unknown);
    }

    #[test]
    fn test_value_without_options() {
        let req = Requirement::new(RequirementKind::Model, "m", "X --port=80 --privileged");
        assert_eq!(req.value_without_options(), "X");

        let req = Requirement::new(RequirementKind::Model, "m", "");
        assert_eq!(req.value_without_options(), "");
    }

    #[test]
    fn test_registered_os_arch() {
        let mut m = model();
        assert_eq!(m.registered_os_arch(), None);

        m.registered_os = Some("linux".to_string());
        assert_eq!(m.registered_os_arch(), None);

        m.registered_arch = Some("amd64".to_string());
        assert_eq!(m.registered_os_arch().as_deref(), Some("linux/amd64"));
    }

    #[test]
    fn test_poisoned_only_for_foreign_groups() {
        let mut m = model();
        m.nb_spawn_err = MAX_SPAWN_ERRORS;
        assert!(!m.is_poisoned_for(GroupId::new(1)));

        m.nb_spawn_err = MAX_SPAWN_ERRORS + 1;
        assert!(m.is_poisoned_for(GroupId::new(1)));
        assert!(!m.is_poisoned_for(GroupId::new(7)));
    }

    #[test]
    fn test_registration_outdated() {
        let mut m = model();
        assert!(m.registration_outdated());

        m.last_registration = Some(m.user_last_modified + chrono::Duration::seconds(1));
        assert!(!m.registration_outdated());
    }

    #[test]
    fn test_worker_status_serialization() {
        let json = serde_json::to_string(&WorkerStatus::Registering).unwrap();
        assert_eq!(json, "\"registering\"");
        assert!(!WorkerStatus::ACTIVE.contains(&WorkerStatus::Disabled));
    }

    #[test]
    fn test_spawn_msg_display() {
        let msg = SpawnMsg::new(
            SpawnMsgId::HatcheryErrorSpawn,
            vec!["h1".into(), "golang".into(), "2s".into(), "boom".into()],
        );
        assert_eq!(
            msg.to_string(),
            "Hatchery h1 cannot spawn worker with model golang after 2s: boom"
        );

        let short = SpawnMsg::new(SpawnMsgId::HatcheryStarts, vec!["h1".into()]);
        assert_eq!(short.to_string(), "Hatchery h1 starts worker with model ?");
    }

    #[test]
    fn test_id_is_transparent() {
        let id = JobId::new(42);
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        assert!(HatcheryId::default().is_unset());
        assert_eq!(JobId::KIND, "job");
    }
}
