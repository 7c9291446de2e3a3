//! Engine wiring.
//!
//! [`Engine`] owns the state shared by the loops (identity, counters, token
//! issuer) and starts one task per loop plus the starter pool, all under a
//! single shutdown signal:
//!
//! - **Dispatcher**: turns jobs from the intake into spawn requests
//! - **Starter pool**: spawns workers
//! - **Registration scheduler**: registers worker models
//! - **Reaper**: kills disabled workers
//! - **Heartbeat**: keeps the hatchery registered; the only loop that can
//!   end the engine on its own

use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};
use hatchery_sdk::{Job, JobServer, SpawnDriver};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::capacity::{CapacityGate, SpawnCounters};
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::heartbeat::{Heartbeat, HeartbeatError};
use crate::identity::Identity;
use crate::matcher::Matcher;
use crate::pool::WorkerPool;
use crate::reaper::Reaper;
use crate::register::RegistrationScheduler;
use crate::starter::{Starter, StarterPool};
use crate::token::TokenIssuer;

/// A configured, not yet running, hatchery engine.
pub struct Engine {
    config: Config,
    job_server: Arc<dyn JobServer>,
    driver: Arc<dyn SpawnDriver>,
    tokens: Arc<TokenIssuer>,
    identity: Arc<Identity>,
    counters: Arc<SpawnCounters>,
}

impl Engine {
    pub fn new(
        config: Config,
        job_server: Arc<dyn JobServer>,
        driver: Arc<dyn SpawnDriver>,
        tokens: TokenIssuer,
    ) -> Result<Self> {
        config.validate()?;
        ensure!(
            driver.model_type() == config.model_type,
            "driver serves {} models but the hatchery is configured for {}",
            driver.model_type(),
            config.model_type
        );

        let identity = Arc::new(Identity::new(&config, tokens.public_key_base64()));
        Ok(Self {
            config,
            job_server,
            driver,
            tokens: Arc::new(tokens),
            identity,
            counters: SpawnCounters::new(),
        })
    }

    pub fn identity(&self) -> Arc<Identity> {
        Arc::clone(&self.identity)
    }

    pub fn counters(&self) -> Arc<SpawnCounters> {
        Arc::clone(&self.counters)
    }

    /// Start every loop. Jobs are read from `jobs` until it closes or
    /// shutdown is signalled.
    pub fn start(self, jobs: mpsc::Receiver<Job>, shutdown: watch::Receiver<bool>) -> RunningEngine {
        let provision = &self.config.provision;
        let pool = WorkerPool::new(Arc::clone(&self.job_server), Arc::clone(&self.driver));
        let gate = CapacityGate::new(pool.clone(), Arc::clone(&self.counters), provision);
        let matcher = Matcher::new(
            self.config.model_type,
            self.config.group_id,
            Arc::clone(&self.driver),
        );

        let starter = StarterPool::start(
            Starter {
                job_server: Arc::clone(&self.job_server),
                driver: Arc::clone(&self.driver),
                matcher: matcher.clone(),
                counters: Arc::clone(&self.counters),
                tokens: Arc::clone(&self.tokens),
                identity: Arc::clone(&self.identity),
                max_in_flight: provision.max_concurrent_provisioning,
                token_ttl: self.config.worker_token_ttl,
            },
            provision.max_concurrent_provisioning,
            shutdown.clone(),
        );

        let dispatcher = Dispatcher::new(
            Arc::clone(&self.job_server),
            matcher,
            gate.clone(),
            starter.queue(),
            self.config.name.clone(),
            self.config.hostname.clone(),
            provision.grace_time_queued,
            provision.max_attempts_before_failure,
        );

        let registration = RegistrationScheduler {
            job_server: Arc::clone(&self.job_server),
            driver: Arc::clone(&self.driver),
            pool: pool.clone(),
            gate,
            queue: starter.queue(),
            counters: Arc::clone(&self.counters),
            model_type: self.config.model_type,
            group_id: self.config.group_id,
            frequency: provision.register_frequency,
            max_registering: provision.max_registering(),
        };

        let reaper = Reaper::new(pool, Arc::clone(&self.driver), self.config.heartbeat_interval);

        let heartbeat = Heartbeat::new(
            Arc::clone(&self.job_server),
            Arc::clone(&self.identity),
            self.config.heartbeat_interval,
            self.config.max_heartbeat_failures,
        );

        let tasks = vec![
            tokio::spawn(dispatcher.run(jobs, shutdown.clone())),
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move { registration.run(shutdown).await }
            }),
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move { reaper.run(shutdown).await }
            }),
        ];
        let heartbeat = tokio::spawn(heartbeat.run(shutdown));

        info!(
            hatchery = %self.identity.name(),
            model_type = %self.config.model_type,
            max_worker = provision.max_worker,
            max_concurrent_provisioning = provision.max_concurrent_provisioning,
            "Hatchery engine started"
        );

        RunningEngine {
            heartbeat: Some(heartbeat),
            tasks,
            starter,
        }
    }
}

/// Handles of a started engine.
pub struct RunningEngine {
    heartbeat: Option<JoinHandle<Result<(), HeartbeatError>>>,
    tasks: Vec<JoinHandle<()>>,
    starter: StarterPool,
}

impl RunningEngine {
    /// Wait for the heartbeat loop to end. It ends on shutdown or with an
    /// error after sustained job server failure.
    pub async fn heartbeat_finished(&mut self) -> Result<()> {
        let Some(handle) = self.heartbeat.as_mut() else {
            return Ok(());
        };
        let result = handle.await;
        self.heartbeat = None;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(e) => Err(anyhow!("heartbeat task failed: {e}")),
        }
    }

    /// Wait for every loop to stop. Shutdown must have been signalled.
    pub async fn join(mut self) {
        if let Err(e) = self.heartbeat_finished().await {
            error!(error = %e, "Heartbeat loop ended with an error");
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Engine task panicked");
            }
        }
        self.starter.join().await;
        info!("Hatchery engine stopped");
    }
}
