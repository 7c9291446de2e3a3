//! Job dispatch.
//!
//! Consumes candidate jobs from the intake channel, filters them and turns
//! the ones this hatchery can serve into job spawn requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hatchery_sdk::{Job, JobId, JobServer, SpawnInfo, SpawnMsgId};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::capacity::CapacityGate;
use crate::matcher::Matcher;
use crate::starter::{JobSpawn, SpawnQueue, SpawnRequest};

/// How long a job handed to the starter pool is not considered again.
pub const RECENTLY_SPAWNED_TTL: Duration = Duration::from_secs(10);

/// How long a given-up job is remembered, so that it gets a single message.
const GIVEN_UP_TTL: Duration = Duration::from_secs(600);

/// What happened to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Submitted,
    RecentlySpawned,
    InGracePeriod,
    TooManyAttempts,
    NoCapacity,
    NoMatchingModel,
    Failed,
}

/// Turns jobs into spawn requests.
pub struct Dispatcher {
    job_server: Arc<dyn JobServer>,
    matcher: Matcher,
    gate: CapacityGate,
    queue: SpawnQueue,
    hatchery_name: String,
    hostname: String,
    grace_time: Duration,
    max_attempts: u32,
    recently_spawned: HashMap<JobId, Instant>,
    given_up: HashMap<JobId, Instant>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_server: Arc<dyn JobServer>,
        matcher: Matcher,
        gate: CapacityGate,
        queue: SpawnQueue,
        hatchery_name: String,
        hostname: String,
        grace_time: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            job_server,
            matcher,
            gate,
            queue,
            hatchery_name,
            hostname,
            grace_time,
            max_attempts,
            recently_spawned: HashMap::new(),
            given_up: HashMap::new(),
        }
    }

    /// Consume jobs until shutdown or until the intake closes.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut jobs: mpsc::Receiver<Job>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting job dispatcher");

        loop {
            tokio::select! {
                job = jobs.recv() => {
                    let Some(job) = job else {
                        info!("Job intake closed");
                        break;
                    };
                    let job_id = job.id;
                    let outcome = self.dispatch(job).await;
                    debug!(job_id = %job_id, ?outcome, "Job dispatched");
                }
                _ = shutdown.changed() => {
                    info!("Job dispatcher shutting down");
                    break;
                }
            }
        }
    }

    /// Handle one job.
    pub async fn dispatch(&mut self, job: Job) -> Dispatch {
        let now = Instant::now();
        self.recently_spawned
            .retain(|_, at| now.duration_since(*at) < RECENTLY_SPAWNED_TTL);
        self.given_up
            .retain(|_, at| now.duration_since(*at) < GIVEN_UP_TTL);

        if self.recently_spawned.contains_key(&job.id) {
            return Dispatch::RecentlySpawned;
        }

        if self.in_grace_period(&job) {
            return Dispatch::InGracePeriod;
        }

        if job.spawn_attempts > self.max_attempts {
            if self.given_up.insert(job.id, now).is_none() {
                self.give_up(&job).await;
            }
            return Dispatch::TooManyAttempts;
        }

        if !self.gate.can_admit_more().await {
            return Dispatch::NoCapacity;
        }

        let models = match self.job_server.list_worker_models().await {
            Ok(models) => models,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Cannot list worker models");
                return Dispatch::Failed;
            }
        };

        let candidates: Vec<_> = models
            .into_iter()
            .filter(|m| {
                self.matcher.can_run_job(
                    m,
                    Some(job.id),
                    &job.requirements,
                    &self.hostname,
                    &job.exec_groups,
                )
            })
            .collect();

        if candidates.is_empty() {
            debug!(job_id = %job.id, "No model can run job");
            return Dispatch::NoMatchingModel;
        }

        let job_id = job.id;
        let request = SpawnRequest::Job(JobSpawn {
            job_id,
            models: candidates,
            requirements: job.requirements,
            exec_groups: job.exec_groups,
            hostname: self.hostname.clone(),
            spawn_attempts: job.spawn_attempts,
            enqueued_at: now,
        });

        if let Err(e) = self.queue.submit(request).await {
            warn!(job_id = %job_id, error = %e, "Cannot submit job spawn request");
            return Dispatch::Failed;
        }

        self.recently_spawned.insert(job_id, Instant::now());
        Dispatch::Submitted
    }

    fn in_grace_period(&self, job: &Job) -> bool {
        if self.grace_time.is_zero() {
            return false;
        }
        let age = (Utc::now() - job.queued).to_std().unwrap_or(Duration::ZERO);
        age < self.grace_time
    }

    async fn give_up(&self, job: &Job) {
        info!(
            job_id = %job.id,
            spawn_attempts = job.spawn_attempts,
            max_attempts = self.max_attempts,
            "Too many spawn attempts, giving up on job"
        );
        let info = SpawnInfo::now(
            SpawnMsgId::HatcheryTooManyAttempts,
            vec![self.hatchery_name.clone(), job.spawn_attempts.to_string()],
        );
        if let Err(e) = self.job_server.send_spawn_info(job.id, &[info]).await {
            warn!(job_id = %job.id, error = %e, "Cannot send spawn info");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use hatchery_sdk::{GroupId, ModelType, Requirement, RequirementKind};
    use hatchery_testing::{job, model, FakeDriver, FakeJobServer};

    use crate::capacity::SpawnCounters;
    use crate::config::ProvisionConfig;
    use crate::pool::WorkerPool;

    struct Fixture {
        server: Arc<FakeJobServer>,
        driver: Arc<FakeDriver>,
        dispatcher: Dispatcher,
        rx: mpsc::Receiver<SpawnRequest>,
    }

    fn fixture(grace_time: Duration) -> Fixture {
        let server = Arc::new(FakeJobServer::new().with_models(vec![
            model(1, "golang", ModelType::Docker),
            model(2, "rust", ModelType::Docker),
            model(3, "vm", ModelType::Openstack),
        ]));
        let driver = Arc::new(FakeDriver::new(ModelType::Docker));
        let pool = WorkerPool::new(server.clone(), driver.clone());
        let gate = CapacityGate::new(pool, SpawnCounters::new(), &ProvisionConfig::default());
        let (queue, rx) = SpawnQueue::channel(16);

        let dispatcher = Dispatcher::new(
            server.clone(),
            Matcher::new(ModelType::Docker, GroupId::new(1), driver.clone()),
            gate,
            queue,
            "hatchery-test".to_string(),
            "host-a".to_string(),
            grace_time,
            5,
        );
        Fixture {
            server,
            driver,
            dispatcher,
            rx,
        }
    }

    fn submitted_models(rx: &mut mpsc::Receiver<SpawnRequest>) -> Vec<String> {
        match rx.try_recv() {
            Ok(SpawnRequest::Job(job)) => job.models.into_iter().map(|m| m.name).collect(),
            _ => vec![],
        }
    }

    #[tokio::test]
    async fn test_submits_matching_candidates() {
        let mut f = fixture(Duration::ZERO);

        let outcome = f.dispatcher.dispatch(job(1, vec![])).await;

        assert_eq!(outcome, Dispatch::Submitted);
        assert_eq!(
            submitted_models(&mut f.rx),
            vec!["golang".to_string(), "rust".to_string()]
        );
    }

    #[tokio::test]
    async fn test_pinned_model_narrows_candidates() {
        let mut f = fixture(Duration::ZERO);
        let reqs = vec![Requirement::new(RequirementKind::Model, "model", "rust --memory=2g")];

        f.dispatcher.dispatch(job(1, reqs)).await;

        assert_eq!(submitted_models(&mut f.rx), vec!["rust".to_string()]);
    }

    #[tokio::test]
    async fn test_no_matching_model() {
        let mut f = fixture(Duration::ZERO);
        let reqs = vec![Requirement::new(RequirementKind::Model, "model", "python")];

        assert_eq!(
            f.dispatcher.dispatch(job(1, reqs)).await,
            Dispatch::NoMatchingModel
        );
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recently_spawned_jobs_are_skipped() {
        let mut f = fixture(Duration::ZERO);

        assert_eq!(f.dispatcher.dispatch(job(1, vec![])).await, Dispatch::Submitted);
        assert_eq!(
            f.dispatcher.dispatch(job(1, vec![])).await,
            Dispatch::RecentlySpawned
        );

        tokio::time::advance(RECENTLY_SPAWNED_TTL + Duration::from_secs(1)).await;
        assert_eq!(f.dispatcher.dispatch(job(1, vec![])).await, Dispatch::Submitted);
    }

    #[tokio::test]
    async fn test_grace_period() {
        let mut f = fixture(Duration::from_secs(30));

        let mut fresh = job(1, vec![]);
        fresh.queued = Utc::now() - ChronoDuration::seconds(5);
        assert_eq!(f.dispatcher.dispatch(fresh).await, Dispatch::InGracePeriod);

        let mut old = job(2, vec![]);
        old.queued = Utc::now() - ChronoDuration::seconds(60);
        assert_eq!(f.dispatcher.dispatch(old).await, Dispatch::Submitted);
    }

    #[tokio::test]
    async fn test_too_many_attempts_sends_one_message() {
        let mut f = fixture(Duration::ZERO);
        let mut exhausted = job(1, vec![]);
        exhausted.spawn_attempts = 6;

        assert_eq!(
            f.dispatcher.dispatch(exhausted.clone()).await,
            Dispatch::TooManyAttempts
        );
        assert_eq!(
            f.dispatcher.dispatch(exhausted).await,
            Dispatch::TooManyAttempts
        );

        let infos = f.server.spawn_infos(JobId::new(1));
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].message.id, SpawnMsgId::HatcheryTooManyAttempts);
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_attempts_at_ceiling_still_dispatch() {
        let mut f = fixture(Duration::ZERO);
        let mut j = job(1, vec![]);
        j.spawn_attempts = 5;

        assert_eq!(f.dispatcher.dispatch(j).await, Dispatch::Submitted);
    }

    #[tokio::test]
    async fn test_no_capacity() {
        let mut f = fixture(Duration::ZERO);
        f.driver.set_started(&[
            "a", "b", "c", "d", "e", "f", "g", "h", "i", "j",
        ]);

        assert_eq!(f.dispatcher.dispatch(job(1, vec![])).await, Dispatch::NoCapacity);
    }
}
