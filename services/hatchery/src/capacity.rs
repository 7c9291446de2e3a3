//! Admission control.
//!
//! [`SpawnCounters`] holds the only mutable state shared by the loops: the
//! number of spawn attempts in flight and the number of models registering.
//! Both are touched through atomics and released by RAII guards, so every
//! exit path of a spawn attempt gives its slot back.
//!
//! [`CapacityGate`] is consulted before every spawn and registration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hatchery_reconcile::PoolStats;
use hatchery_sdk::WorkerStatus;
use tracing::{debug, warn};

use crate::config::ProvisionConfig;
use crate::pool::WorkerPool;

/// Counters owned by one engine instance.
#[derive(Debug, Default)]
pub struct SpawnCounters {
    in_flight: AtomicUsize,
    registering: AtomicUsize,
}

impl SpawnCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Spawn attempts currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Models with a register-only spawn queued or running.
    pub fn registering(&self) -> usize {
        self.registering.load(Ordering::SeqCst)
    }

    /// Take an in-flight slot unless `ceiling` slots are already taken.
    pub fn try_start_spawn(self: &Arc<Self>, ceiling: usize) -> Option<InFlightGuard> {
        acquire(&self.in_flight, ceiling).then(|| InFlightGuard {
            counters: Arc::clone(self),
        })
    }

    /// Take a registration slot unless `ceiling` models are already registering.
    pub fn try_start_registration(self: &Arc<Self>, ceiling: usize) -> Option<RegistrationSlot> {
        acquire(&self.registering, ceiling).then(|| RegistrationSlot {
            counters: Arc::clone(self),
        })
    }
}

fn acquire(counter: &AtomicUsize, ceiling: usize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            (current < ceiling).then_some(current + 1)
        })
        .is_ok()
}

/// One running spawn attempt. Released on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    counters: Arc<SpawnCounters>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One model registering. Travels with the register-only request and is
/// released when the request is done with, whatever the outcome.
#[derive(Debug)]
pub struct RegistrationSlot {
    counters: Arc<SpawnCounters>,
}

impl Drop for RegistrationSlot {
    fn drop(&mut self) {
        self.counters.registering.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Decides whether one more worker may be started.
#[derive(Clone)]
pub struct CapacityGate {
    pool: WorkerPool,
    counters: Arc<SpawnCounters>,
    max_worker: usize,
    max_provisioning: usize,
}

impl CapacityGate {
    pub fn new(pool: WorkerPool, counters: Arc<SpawnCounters>, provision: &ProvisionConfig) -> Self {
        Self {
            pool,
            counters,
            max_worker: provision.max_worker,
            max_provisioning: provision.max_concurrent_provisioning,
        }
    }

    /// Whether the pool and the in-flight spawns leave room for one more worker.
    ///
    /// An unreadable pool denies admission; the caller retries on its next tick.
    pub async fn can_admit_more(&self) -> bool {
        let pool = match self.pool.reconcile(&WorkerStatus::ACTIVE).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!(error = %e, "Cannot compute worker pool, denying admission");
                return false;
            }
        };
        let stats = PoolStats::of(&pool);

        if stats.active >= self.max_worker {
            debug!(
                active = stats.active,
                max_worker = self.max_worker,
                "Worker ceiling reached"
            );
            return false;
        }

        if stats.pending >= self.max_provisioning {
            debug!(
                pending = stats.pending,
                max_provisioning = self.max_provisioning,
                "Too many workers pending"
            );
            return false;
        }

        let in_flight = self.counters.in_flight();
        if in_flight >= self.max_provisioning {
            debug!(
                in_flight,
                max_provisioning = self.max_provisioning,
                "Too many spawns in flight"
            );
            return false;
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatchery_sdk::{ModelType, RegisteredWorker, WorkerId};
    use hatchery_testing::{FakeDriver, FakeJobServer};

    fn gate(
        server: Arc<FakeJobServer>,
        driver: Arc<FakeDriver>,
        counters: Arc<SpawnCounters>,
        max_worker: usize,
        max_provisioning: usize,
    ) -> CapacityGate {
        let provision = ProvisionConfig {
            max_worker,
            max_concurrent_provisioning: max_provisioning,
            ..ProvisionConfig::default()
        };
        CapacityGate::new(WorkerPool::new(server, driver), counters, &provision)
    }

    #[test]
    fn test_in_flight_guard_releases_slot() {
        let counters = SpawnCounters::new();

        let first = counters.try_start_spawn(2).unwrap();
        let second = counters.try_start_spawn(2).unwrap();
        assert!(counters.try_start_spawn(2).is_none());
        assert_eq!(counters.in_flight(), 2);

        drop(first);
        assert_eq!(counters.in_flight(), 1);
        drop(second);
        assert_eq!(counters.in_flight(), 0);
    }

    #[test]
    fn test_registration_slot_releases_on_drop() {
        let counters = SpawnCounters::new();

        let slot = counters.try_start_registration(1).unwrap();
        assert!(counters.try_start_registration(1).is_none());
        drop(slot);
        assert_eq!(counters.registering(), 0);
    }

    #[tokio::test]
    async fn test_admits_when_empty() {
        let gate = gate(
            Arc::new(FakeJobServer::new()),
            Arc::new(FakeDriver::new(ModelType::Docker)),
            SpawnCounters::new(),
            2,
            2,
        );
        assert!(gate.can_admit_more().await);
    }

    #[tokio::test]
    async fn test_denies_at_worker_ceiling() {
        let server = Arc::new(FakeJobServer::new().with_workers(vec![RegisteredWorker {
            id: WorkerId::new(1),
            name: "A".to_string(),
            status: WorkerStatus::Building,
            model_id: None,
            job_id: None,
        }]));
        let driver = Arc::new(FakeDriver::new(ModelType::Docker).with_started(&["A", "B"]));

        let gate = gate(server, driver, SpawnCounters::new(), 2, 5);
        assert!(!gate.can_admit_more().await);
    }

    #[tokio::test]
    async fn test_disabled_workers_do_not_count() {
        let server = Arc::new(FakeJobServer::new().with_workers(vec![RegisteredWorker {
            id: WorkerId::new(1),
            name: "A".to_string(),
            status: WorkerStatus::Disabled,
            model_id: None,
            job_id: None,
        }]));
        let driver = Arc::new(FakeDriver::new(ModelType::Docker).with_started(&["A"]));

        let gate = gate(server, driver, SpawnCounters::new(), 1, 1);
        assert!(gate.can_admit_more().await);
    }

    #[tokio::test]
    async fn test_denies_when_too_many_pending() {
        let driver = Arc::new(FakeDriver::new(ModelType::Docker).with_started(&["B", "C"]));

        let gate = gate(Arc::new(FakeJobServer::new()), driver, SpawnCounters::new(), 10, 2);
        assert!(!gate.can_admit_more().await);
    }

    #[tokio::test]
    async fn test_denies_when_spawns_in_flight() {
        let counters = SpawnCounters::new();
        let _slot = counters.try_start_spawn(1).unwrap();

        let gate = gate(
            Arc::new(FakeJobServer::new()),
            Arc::new(FakeDriver::new(ModelType::Docker)),
            counters,
            10,
            1,
        );
        assert!(!gate.can_admit_more().await);
    }

    #[tokio::test]
    async fn test_denies_when_pool_unreadable() {
        let server = Arc::new(FakeJobServer::new());
        server.fail_listing(true);

        let gate = gate(
            server,
            Arc::new(FakeDriver::new(ModelType::Docker)),
            SpawnCounters::new(),
            10,
            10,
        );
        assert!(!gate.can_admit_more().await);
    }
}
