//! Worker pool reconciliation.
//!
//! A hatchery sees its workers through two independently changing sources:
//!
//! - **Registered workers**: what the job server knows (real statuses).
//! - **Started instances**: what the spawn driver reports (names only).
//!
//! [`reconcile`] merges both snapshots into one pool of [`WorkerRecord`]s.
//! It performs no I/O; the caller applies the returned correction.
//!
//! # Invariants
//!
//! - A record name appears at most once in a pool
//! - The result depends only on the two input snapshots
//! - At most one inconsistent worker is selected for correction per pass;
//!   further inconsistent workers stay in the pool with their reported
//!   status until a later pass corrects them

use std::collections::HashSet;

use hatchery_sdk::names;
use hatchery_sdk::{RegisteredWorker, WorkerRecord, WorkerStatus};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reconciliation {
    /// Reconciled pool, registered workers first, then local-only instances.
    pub pool: Vec<WorkerRecord>,

    /// Registered, not disabled, not started anywhere: must be force-disabled.
    pub correction: Option<RegisteredWorker>,

    /// Inconsistent workers left for later passes.
    pub deferred: Vec<RegisteredWorker>,
}

/// Merge registered workers with started instance names.
pub fn reconcile(registered: &[RegisteredWorker], started: &[String]) -> Reconciliation {
    let mut remaining: Vec<&str> = Vec::with_capacity(started.len());
    for name in started {
        if !remaining.contains(&name.as_str()) {
            remaining.push(name);
        }
    }

    let mut result = Reconciliation::default();
    let mut seen: HashSet<String> = HashSet::new();

    for worker in registered {
        if seen.contains(&worker.name) {
            continue;
        }

        let instance = remaining.iter().position(|n| *n == worker.name);
        let record = match instance {
            Some(pos) => {
                let name = remaining.remove(pos);
                registered_record(worker, Some(name))
            }
            None if worker.status == WorkerStatus::Disabled => registered_record(worker, None),
            None if result.correction.is_none() => {
                result.correction = Some(worker.clone());
                continue;
            }
            None => {
                result.deferred.push(worker.clone());
                registered_record(worker, None)
            }
        };

        seen.insert(record.name.clone());
        result.pool.push(record);
    }

    for instance_name in remaining {
        let (logical, register_only) = names::parse_instance_name(instance_name);
        if !seen.insert(logical.to_string()) {
            continue;
        }
        let status = if register_only {
            WorkerStatus::Registering
        } else {
            WorkerStatus::Pending
        };
        result.pool.push(WorkerRecord {
            name: logical.to_string(),
            status,
            worker_id: None,
            instance_name: Some(instance_name.to_string()),
        });
    }

    result
}

fn registered_record(worker: &RegisteredWorker, instance_name: Option<&str>) -> WorkerRecord {
    WorkerRecord {
        name: worker.name.clone(),
        status: worker.status,
        worker_id: Some(worker.id),
        instance_name: instance_name.map(str::to_string),
    }
}

/// Keep only records in one of the given statuses. An empty filter keeps everything.
pub fn filter_by_status(pool: Vec<WorkerRecord>, statuses: &[WorkerStatus]) -> Vec<WorkerRecord> {
    if statuses.is_empty() {
        return pool;
    }
    pool.into_iter()
        .filter(|r| statuses.contains(&r.status))
        .collect()
}

/// Whether a register-only spawn for the model is already under way.
///
/// Job workers of the model booting at the same time do not count.
pub fn registration_in_flight(pool: &[WorkerRecord], model_name: &str) -> bool {
    pool.iter()
        .filter(|r| matches!(r.status, WorkerStatus::Registering | WorkerStatus::Pending))
        .any(|r| {
            let name = r.instance_name.as_deref().unwrap_or(&r.name);
            let (logical, register_only) = names::parse_instance_name(name);
            register_only && names::belongs_to_model(logical, model_name)
        })
}

/// Counters derived from a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Records counted against the worker ceiling.
    pub active: usize,
    pub pending: usize,
    pub registering: usize,
    pub disabled: usize,
}

impl PoolStats {
    pub fn of(pool: &[WorkerRecord]) -> Self {
        let mut stats = PoolStats::default();
        for record in pool {
            if WorkerStatus::ACTIVE.contains(&record.status) {
                stats.active += 1;
            }
            match record.status {
                WorkerStatus::Pending => stats.pending += 1,
                WorkerStatus::Registering => stats.registering += 1,
                WorkerStatus::Disabled => stats.disabled += 1,
                _ => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hatchery_sdk::WorkerId;
    use proptest::prelude::*;

    fn registered(id: i64, name: &str, status: WorkerStatus) -> RegisteredWorker {
        RegisteredWorker {
            id: WorkerId::new(id),
            name: name.to_string(),
            status,
            model_id: None,
            job_id: None,
        }
    }

    fn started(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn summary(pool: &[WorkerRecord]) -> Vec<(&str, WorkerStatus)> {
        pool.iter().map(|r| (r.name.as_str(), r.status)).collect()
    }

    #[test]
    fn test_started_but_unregistered_is_pending() {
        let result = reconcile(
            &[registered(1, "A", WorkerStatus::Building)],
            &started(&["A", "B"]),
        );

        assert_eq!(
            summary(&result.pool),
            vec![("A", WorkerStatus::Building), ("B", WorkerStatus::Pending)]
        );
        assert!(result.correction.is_none());
    }

    #[test]
    fn test_disabled_without_instance_is_kept() {
        let result = reconcile(&[registered(1, "A", WorkerStatus::Disabled)], &[]);

        assert_eq!(summary(&result.pool), vec![("A", WorkerStatus::Disabled)]);
        assert!(result.correction.is_none());
    }

    #[test]
    fn test_live_without_instance_is_corrected() {
        let result = reconcile(&[registered(1, "A", WorkerStatus::Waiting)], &[]);

        assert!(result.pool.is_empty());
        assert_eq!(result.correction.map(|w| w.id), Some(WorkerId::new(1)));
    }

    #[test]
    fn test_one_correction_per_pass() {
        let result = reconcile(
            &[
                registered(1, "A", WorkerStatus::Waiting),
                registered(2, "B", WorkerStatus::Building),
            ],
            &[],
        );

        assert_eq!(result.correction.map(|w| w.id), Some(WorkerId::new(1)));
        assert_eq!(result.deferred.len(), 1);
        assert_eq!(summary(&result.pool), vec![("B", WorkerStatus::Building)]);
    }

    #[test]
    fn test_register_prefix_is_stripped() {
        let result = reconcile(&[], &started(&["register-golang-abcd1234"]));

        assert_eq!(
            summary(&result.pool),
            vec![("golang-abcd1234", WorkerStatus::Registering)]
        );
        assert_eq!(
            result.pool[0].instance_name.as_deref(),
            Some("register-golang-abcd1234")
        );
    }

    #[test]
    fn test_registered_register_worker_keeps_real_status() {
        let result = reconcile(
            &[registered(3, "register-golang-abcd1234", WorkerStatus::Waiting)],
            &started(&["register-golang-abcd1234"]),
        );

        assert_eq!(
            summary(&result.pool),
            vec![("register-golang-abcd1234", WorkerStatus::Waiting)]
        );
    }

    #[test]
    fn test_filter_by_status() {
        let result = reconcile(
            &[registered(1, "A", WorkerStatus::Disabled)],
            &started(&["B", "register-c-abcd1234"]),
        );

        let pending = filter_by_status(result.pool.clone(), &[WorkerStatus::Pending]);
        assert_eq!(summary(&pending), vec![("B", WorkerStatus::Pending)]);

        let all = filter_by_status(result.pool, &[]);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_registration_in_flight() {
        let result = reconcile(&[], &started(&["register-golang-abcd1234"]));
        assert!(registration_in_flight(&result.pool, "golang"));
        assert!(!registration_in_flight(&result.pool, "rust"));
    }

    #[test]
    fn test_booting_job_worker_is_not_a_registration() {
        let result = reconcile(
            &[registered(1, "golang-efgh5678", WorkerStatus::Pending)],
            &started(&["golang-abcd1234", "golang-efgh5678"]),
        );
        assert!(!registration_in_flight(&result.pool, "golang"));

        let result = reconcile(
            &[registered(2, "register-golang-abcd1234", WorkerStatus::Pending)],
            &started(&["register-golang-abcd1234"]),
        );
        assert!(registration_in_flight(&result.pool, "golang"));
    }

    #[test]
    fn test_pool_stats() {
        let result = reconcile(
            &[
                registered(1, "A", WorkerStatus::Disabled),
                registered(2, "B", WorkerStatus::Building),
            ],
            &started(&["B", "C", "register-d-abcd1234"]),
        );

        let stats = PoolStats::of(&result.pool);
        assert_eq!(
            stats,
            PoolStats {
                active: 3,
                pending: 1,
                registering: 1,
                disabled: 1,
            }
        );
    }

    fn status_strategy() -> impl Strategy<Value = WorkerStatus> {
        prop_oneof![
            Just(WorkerStatus::Waiting),
            Just(WorkerStatus::Checking),
            Just(WorkerStatus::Building),
            Just(WorkerStatus::Disabled),
        ]
    }

    fn name_strategy() -> impl Strategy<Value = String> {
        prop_oneof!["[a-d]", "register-[a-d]"]
    }

    proptest! {
        #[test]
        fn reconcile_is_deterministic(
            workers in proptest::collection::vec((name_strategy(), status_strategy()), 0..8),
            instances in proptest::collection::vec(name_strategy(), 0..8),
        ) {
            let workers: Vec<_> = workers
                .into_iter()
                .enumerate()
                .map(|(i, (name, status))| registered(i as i64 + 1, &name, status))
                .collect();

            prop_assert_eq!(reconcile(&workers, &instances), reconcile(&workers, &instances));
        }

        #[test]
        fn reconciled_names_are_unique(
            workers in proptest::collection::vec((name_strategy(), status_strategy()), 0..8),
            instances in proptest::collection::vec(name_strategy(), 0..8),
        ) {
            let workers: Vec<_> = workers
                .into_iter()
                .enumerate()
                .map(|(i, (name, status))| registered(i as i64 + 1, &name, status))
                .collect();

            let result = reconcile(&workers, &instances);
            let mut names: Vec<_> = result.pool.iter().map(|r| r.name.clone()).collect();
            let total = names.len();
            names.sort();
            names.dedup();
            prop_assert_eq!(names.len(), total);
        }
    }
}
