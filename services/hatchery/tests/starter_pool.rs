//! Concurrency tests for the starter pool.
//!
//! Job and register-only requests share one in-flight ceiling; whatever the
//! pool size and the mix of requests, the driver never sees more concurrent
//! spawns than the ceiling and every slot is released afterwards.

use std::sync::Arc;
use std::time::Duration;

use hatchery::capacity::SpawnCounters;
use hatchery::config::Config;
use hatchery::identity::Identity;
use hatchery::matcher::Matcher;
use hatchery::starter::{JobSpawn, RegisterSpawn, SpawnRequest, Starter, StarterPool};
use hatchery::token::TokenIssuer;
use hatchery_sdk::{GroupId, JobId, ModelId, ModelType};
use hatchery_testing::{model, FakeDriver, FakeJobServer};
use tokio::sync::watch;
use tokio::time::Instant;

fn starter(
    server: &Arc<FakeJobServer>,
    driver: &Arc<FakeDriver>,
    counters: &Arc<SpawnCounters>,
    max_in_flight: usize,
) -> Starter {
    let config = Config {
        model_type: ModelType::Docker,
        ..Config::default()
    };
    Starter {
        job_server: server.clone(),
        driver: driver.clone(),
        matcher: Matcher::new(ModelType::Docker, GroupId::new(1), driver.clone()),
        counters: counters.clone(),
        tokens: Arc::new(TokenIssuer::ephemeral("hatchery")),
        identity: Arc::new(Identity::new(&config, "pk".to_string())),
        max_in_flight,
        token_ttl: Duration::from_secs(60),
    }
}

fn job_request(id: i64) -> SpawnRequest {
    SpawnRequest::Job(JobSpawn {
        job_id: JobId::new(id),
        models: vec![model(1, "golang", ModelType::Docker)],
        requirements: vec![],
        exec_groups: vec![],
        hostname: "host".to_string(),
        spawn_attempts: 0,
        enqueued_at: Instant::now(),
    })
}

#[tokio::test]
async fn test_mixed_requests_respect_ceiling() {
    let server = Arc::new(FakeJobServer::new());
    let driver = Arc::new(FakeDriver::new(ModelType::Docker).with_spawn_delay(Duration::from_millis(15)));
    let counters = SpawnCounters::new();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = StarterPool::start(starter(&server, &driver, &counters, 3), 3, shutdown_rx);
    let queue = pool.queue();

    for id in 1..=12 {
        let request = if id % 3 == 0 {
            SpawnRequest::Register(RegisterSpawn {
                model: model(100 + id, "node", ModelType::Docker),
                slot: counters.try_start_registration(usize::MAX),
            })
        } else {
            job_request(id)
        };
        queue.submit(request).await.unwrap();
    }
    drop(queue);
    pool.join().await;

    assert_eq!(driver.spawned().len(), 12);
    assert!(driver.max_concurrent_spawns() <= 3);
    assert_eq!(counters.in_flight(), 0);
    assert_eq!(counters.registering(), 0);
}

#[tokio::test]
async fn test_oversized_pool_drops_requests_above_ceiling() {
    let server = Arc::new(FakeJobServer::new());
    let driver = Arc::new(FakeDriver::new(ModelType::Docker).with_spawn_delay(Duration::from_millis(50)));
    let counters = SpawnCounters::new();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = StarterPool::start(starter(&server, &driver, &counters, 1), 4, shutdown_rx);
    let queue = pool.queue();

    for id in 1..=4 {
        queue.submit(job_request(id)).await.unwrap();
    }
    drop(queue);
    pool.join().await;

    assert!(!driver.spawned().is_empty());
    assert_eq!(driver.max_concurrent_spawns(), 1);
    assert_eq!(counters.in_flight(), 0);
}

#[tokio::test]
async fn test_failed_spawns_release_slots() {
    let server = Arc::new(FakeJobServer::new());
    let driver = Arc::new(FakeDriver::new(ModelType::Docker));
    driver.fail_model(ModelId::new(1));
    let counters = SpawnCounters::new();

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool = StarterPool::start(starter(&server, &driver, &counters, 2), 2, shutdown_rx);
    let queue = pool.queue();

    for id in 1..=5 {
        queue.submit(job_request(id)).await.unwrap();
    }
    drop(queue);
    pool.join().await;

    assert_eq!(server.model_spawn_errors().len(), 5);
    assert_eq!(counters.in_flight(), 0);
}
