//! Worker starter pool.
//!
//! A fixed number of tasks consume spawn requests from one bounded queue.
//! Each request is handled by exactly one task: a job request walks its
//! candidate models until one instance starts, a register-only request
//! makes a single attempt.
//!
//! Every attempt holds an [`InFlightGuard`] for its whole duration, so the
//! in-flight counter cannot exceed the ceiling whatever the pool size.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use hatchery_sdk::{
    names, GroupId, JobId, JobServer, Requirement, SpawnArguments, SpawnDriver, SpawnInfo,
    SpawnMsgId, WorkerModel,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::capacity::{InFlightGuard, RegistrationSlot, SpawnCounters};
use crate::identity::Identity;
use crate::matcher::Matcher;
use crate::token::TokenIssuer;

/// Spawn a worker for a job.
#[derive(Debug)]
pub struct JobSpawn {
    pub job_id: JobId,
    /// Candidate models, tried in order.
    pub models: Vec<WorkerModel>,
    pub requirements: Vec<Requirement>,
    pub exec_groups: Vec<GroupId>,
    pub hostname: String,
    pub spawn_attempts: u32,
    pub enqueued_at: Instant,
}

/// Spawn a register-only worker for a model.
#[derive(Debug)]
pub struct RegisterSpawn {
    pub model: WorkerModel,
    /// Released when the attempt is over.
    pub slot: Option<RegistrationSlot>,
}

/// Work item of the starter pool.
#[derive(Debug)]
pub enum SpawnRequest {
    Job(JobSpawn),
    Register(RegisterSpawn),
}

/// Everything a starter task needs to drive one spawn attempt.
#[derive(Clone)]
pub struct Starter {
    pub job_server: Arc<dyn JobServer>,
    pub driver: Arc<dyn SpawnDriver>,
    pub matcher: Matcher,
    pub counters: Arc<SpawnCounters>,
    pub tokens: Arc<TokenIssuer>,
    pub identity: Arc<Identity>,
    /// Ceiling on spawn attempts in flight.
    pub max_in_flight: usize,
    pub token_ttl: Duration,
}

impl Starter {
    /// Handle one request to completion.
    pub async fn handle(&self, request: SpawnRequest) {
        match request {
            SpawnRequest::Job(job) => self.spawn_for_job(job).await,
            SpawnRequest::Register(register) => self.spawn_for_registration(register).await,
        }
    }

    async fn spawn_for_job(&self, request: JobSpawn) {
        let job_id = request.job_id;
        let Some(_guard) = self.start_attempt() else {
            debug!(job_id = %job_id, "Too many spawns in flight, dropping job request");
            return;
        };

        let queued_for_ms = u64::try_from(request.enqueued_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(
            job_id = %job_id,
            candidates = request.models.len(),
            spawn_attempts = request.spawn_attempts,
            queued_for_ms,
            "Handling job spawn request"
        );

        let mut booked = false;
        for model in &request.models {
            if !self.matcher.can_run_job(
                model,
                Some(job_id),
                &request.requirements,
                &request.hostname,
                &request.exec_groups,
            ) {
                continue;
            }

            if !booked {
                if let Err(e) = self.job_server.book_job(job_id).await {
                    debug!(job_id = %job_id, error = %e, "Cannot book job");
                    return;
                }
                booked = true;
            }

            if self.try_model(model, &request).await {
                return;
            }
        }

        if booked {
            info!(job_id = %job_id, "No worker could be started for job");
        } else {
            debug!(job_id = %job_id, "No candidate model can run job");
        }
    }

    /// One spawn attempt of `model` for a booked job. Returns whether an
    /// instance was started.
    async fn try_model(&self, model: &WorkerModel, request: &JobSpawn) -> bool {
        let job_id = request.job_id;
        let hatchery = self.identity.name().to_string();
        let started_at = Instant::now();

        self.send_spawn_info(
            job_id,
            SpawnMsgId::HatcheryStarts,
            vec![hatchery.clone(), model.name.clone()],
        )
        .await;

        let args = match self.spawn_arguments(model, Some(job_id), &request.requirements, false) {
            Ok(args) => args,
            Err(e) => {
                error!(job_id = %job_id, model = %model.name, error = %e, "Cannot issue worker token");
                self.send_spawn_info(
                    job_id,
                    SpawnMsgId::HatcheryErrorSpawn,
                    vec![hatchery, model.name.clone(), elapsed(started_at), e.to_string()],
                )
                .await;
                return false;
            }
        };
        let worker_name = args.worker_name.clone();

        match self.driver.spawn_worker(args).await {
            Ok(instance) => {
                info!(
                    job_id = %job_id,
                    model = %model.name,
                    worker = %worker_name,
                    instance = %instance,
                    "Worker started"
                );
                self.send_spawn_info(
                    job_id,
                    SpawnMsgId::HatcheryStartsSuccessfully,
                    vec![hatchery, instance, elapsed(started_at)],
                )
                .await;
                true
            }
            Err(e) => {
                warn!(
                    job_id = %job_id,
                    model = %model.name,
                    worker = %worker_name,
                    error = %e,
                    "Cannot spawn worker"
                );
                self.send_spawn_info(
                    job_id,
                    SpawnMsgId::HatcheryErrorSpawn,
                    vec![hatchery, model.name.clone(), elapsed(started_at), e.to_string()],
                )
                .await;
                self.report_model_error(model, &e.to_string()).await;
                false
            }
        }
    }

    async fn spawn_for_registration(&self, request: RegisterSpawn) {
        let RegisterSpawn { model, slot } = request;
        let Some(_guard) = self.start_attempt() else {
            debug!(model = %model.name, "Too many spawns in flight, dropping registration");
            return;
        };

        let args = match self.spawn_arguments(&model, None, &[], true) {
            Ok(args) => args,
            Err(e) => {
                error!(model = %model.name, error = %e, "Cannot issue worker token");
                return;
            }
        };
        let worker_name = args.worker_name.clone();

        match self.driver.spawn_worker(args).await {
            Ok(instance) => {
                info!(
                    model = %model.name,
                    worker = %worker_name,
                    instance = %instance,
                    "Registration worker started"
                );
            }
            Err(e) => {
                warn!(model = %model.name, error = %e, "Cannot spawn registration worker");
                self.report_model_error(&model, &e.to_string()).await;
            }
        }

        drop(slot);
    }

    fn start_attempt(&self) -> Option<InFlightGuard> {
        self.counters.try_start_spawn(self.max_in_flight)
    }

    fn spawn_arguments(
        &self,
        model: &WorkerModel,
        job_id: Option<JobId>,
        requirements: &[Requirement],
        register_only: bool,
    ) -> Result<SpawnArguments> {
        let mut args = SpawnArguments {
            worker_name: names::generate_worker_name(&model.name, register_only),
            worker_token: String::new(),
            model: model.clone(),
            job_id,
            requirements: requirements.to_vec(),
            register_only,
            hatchery_name: self.identity.name().to_string(),
        };
        args.worker_token = self.tokens.issue(&args, self.token_ttl)?;
        Ok(args)
    }

    async fn send_spawn_info(&self, job_id: JobId, id: SpawnMsgId, args: Vec<String>) {
        let info = SpawnInfo::now(id, args);
        if let Err(e) = self.job_server.send_spawn_info(job_id, &[info]).await {
            warn!(job_id = %job_id, error = %e, "Cannot send spawn info");
        }
    }

    async fn report_model_error(&self, model: &WorkerModel, message: &str) {
        if let Err(e) = self
            .job_server
            .report_model_spawn_error(model.id, message)
            .await
        {
            warn!(model = %model.name, error = %e, "Cannot report model spawn error");
        }
    }
}

fn elapsed(since: Instant) -> String {
    format!("{:.3}s", since.elapsed().as_secs_f64())
}

/// Sending side of the starter queue.
#[derive(Clone)]
pub struct SpawnQueue {
    tx: mpsc::Sender<SpawnRequest>,
}

impl SpawnQueue {
    /// A queue and its receiving end.
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<SpawnRequest>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    /// Enqueue a request, waiting while the queue is full.
    pub async fn submit(&self, request: SpawnRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| anyhow!("starter pool is closed"))
    }
}

/// The running starter tasks.
pub struct StarterPool {
    queue: SpawnQueue,
    workers: Vec<JoinHandle<()>>,
}

impl StarterPool {
    /// Start `size` tasks sharing one queue of depth 1.
    pub fn start(starter: Starter, size: usize, shutdown: watch::Receiver<bool>) -> Self {
        let (queue, rx) = SpawnQueue::channel(1);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..size.max(1))
            .map(|index| {
                let starter = starter.clone();
                let rx = Arc::clone(&rx);
                let shutdown = shutdown.clone();
                tokio::spawn(run_worker(index, starter, rx, shutdown))
            })
            .collect();

        info!(size, "Starter pool started");

        Self { queue, workers }
    }

    pub fn queue(&self) -> SpawnQueue {
        self.queue.clone()
    }

    /// Close the queue and wait for every task. Requests already queued are
    /// still handled unless shutdown was signalled.
    pub async fn join(self) {
        drop(self.queue);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Starter task panicked");
            }
        }
    }
}

async fn run_worker(
    index: usize,
    starter: Starter,
    rx: Arc<Mutex<mpsc::Receiver<SpawnRequest>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let request = {
            let mut rx = rx.lock().await;
            tokio::select! {
                request = rx.recv() => request,
                _ = shutdown.changed() => None,
            }
        };

        match request {
            Some(request) => starter.handle(request).await,
            None => break,
        }
    }

    debug!(worker = index, "Starter task stopped");
}
