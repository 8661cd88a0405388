//! The worker pool: which workers are attached, healthy, and within
//! capacity.
//!
//! Running-build counts are mutated only through [`WorkerPool::reserve`] and
//! [`WorkerPool::release_slot`], driven by the distributor and by
//! build-completion handling. The heartbeat sweep only flips `Idle → Lost`
//! and never touches counts, so liveness checking cannot double-account a
//! slot.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use conductor_core::config::NextWorkerPolicy;
use conductor_core::{BuildRequestId, WorkerHealth, WorkerState};

struct PoolInner {
    workers: HashMap<String, WorkerState>,
    /// Worker names the current configuration admits.
    known: HashSet<String>,
}

/// The set of currently attached worker connections.
pub struct WorkerPool {
    inner: Mutex<PoolInner>,
    heartbeat_timeout: Duration,
}

impl WorkerPool {
    pub fn new(heartbeat_timeout: std::time::Duration) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                workers: HashMap::new(),
                known: HashSet::new(),
            }),
            heartbeat_timeout: Duration::from_std(heartbeat_timeout)
                .unwrap_or_else(|_| Duration::seconds(300)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Replace the configured worker set. Attached workers that fell out of
    /// the configuration are detached; their orphaned requests are returned.
    pub fn set_known_workers(&self, names: &[String]) -> Vec<BuildRequestId> {
        let mut inner = self.lock();
        inner.known = names.iter().cloned().collect();
        let dropped: Vec<String> = inner
            .workers
            .keys()
            .filter(|name| !inner.known.contains(*name))
            .cloned()
            .collect();
        let mut orphaned = Vec::new();
        for name in dropped {
            if let Some(worker) = inner.workers.remove(&name) {
                warn!(worker = %name, "worker removed from configuration; detaching");
                orphaned.extend(worker.running);
            }
        }
        orphaned
    }

    /// Complete a handshake: attach the worker as idle. Returns `false` if
    /// the name is not in the configured worker set; the connection should
    /// be refused.
    pub fn attach(&self, name: &str, capabilities: Vec<String>, max_builds: usize) -> bool {
        let mut inner = self.lock();
        if !inner.known.contains(name) {
            warn!(worker = name, "handshake from unconfigured worker refused");
            return false;
        }
        info!(worker = name, max_builds, "worker attached");
        inner.workers.insert(
            name.to_string(),
            WorkerState {
                name: name.to_string(),
                capabilities: capabilities.into_iter().collect(),
                max_builds: max_builds.max(1),
                running: HashSet::new(),
                health: WorkerHealth::Idle,
                last_seen: Utc::now(),
            },
        );
        true
    }

    /// Drop a worker on disconnect, returning the requests that were
    /// running on it so their claims can be released.
    pub fn detach(&self, name: &str) -> Vec<BuildRequestId> {
        let mut inner = self.lock();
        match inner.workers.remove(name) {
            Some(worker) => {
                let orphaned: Vec<BuildRequestId> = worker.running.into_iter().collect();
                if !orphaned.is_empty() {
                    warn!(
                        worker = name,
                        orphaned = orphaned.len(),
                        "worker disconnected with running builds"
                    );
                }
                orphaned
            }
            None => Vec::new(),
        }
    }

    pub fn heartbeat(&self, name: &str) {
        let mut inner = self.lock();
        if let Some(worker) = inner.workers.get_mut(name) {
            worker.last_seen = Utc::now();
        }
    }

    /// Mark idle workers that missed their heartbeat window as lost.
    /// Returns the names that newly transitioned.
    pub fn sweep_lost(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut inner = self.lock();
        let timeout = self.heartbeat_timeout;
        let mut lost = Vec::new();
        for worker in inner.workers.values_mut() {
            if worker.health == WorkerHealth::Idle && now - worker.last_seen > timeout {
                worker.health = WorkerHealth::Lost;
                warn!(worker = %worker.name, "worker missed heartbeats; marked lost");
                lost.push(worker.name.clone());
            }
        }
        lost
    }

    /// Workers able to take a build for `builder_name` right now, ordered
    /// by the builder's selection policy over its configured worker order.
    pub fn find_idle_eligible(
        &self,
        builder_name: &str,
        configured_order: &[String],
        policy: NextWorkerPolicy,
    ) -> Vec<String> {
        let inner = self.lock();
        let mut eligible: Vec<(&WorkerState, usize)> = configured_order
            .iter()
            .enumerate()
            .filter_map(|(position, name)| {
                inner.workers.get(name).map(|worker| (worker, position))
            })
            .filter(|(worker, _)| {
                worker.health == WorkerHealth::Idle
                    && worker.has_capacity()
                    && worker.capabilities.contains(builder_name)
            })
            .collect();

        match policy {
            NextWorkerPolicy::InOrder => eligible.sort_by_key(|(_, position)| *position),
            NextWorkerPolicy::LeastLoaded => {
                eligible.sort_by_key(|(worker, position)| (worker.load(), *position));
            }
        }

        eligible
            .into_iter()
            .map(|(worker, _)| worker.name.clone())
            .collect()
    }

    /// Reserve a build slot on `name` for `request`.
    ///
    /// Re-checks health and capacity under the table lock so a racing pass
    /// cannot oversubscribe the worker; the caller must undo with
    /// [`WorkerPool::release_slot`] if the subsequent claim or start fails.
    pub fn reserve(&self, name: &str, request: BuildRequestId) -> bool {
        let mut inner = self.lock();
        let Some(worker) = inner.workers.get_mut(name) else {
            return false;
        };
        if worker.health != WorkerHealth::Idle || !worker.has_capacity() {
            return false;
        }
        worker.running.insert(request);
        if !worker.has_capacity() {
            worker.health = WorkerHealth::Busy;
        }
        true
    }

    /// Return a build slot. Idempotent.
    pub fn release_slot(&self, name: &str, request: BuildRequestId) {
        let mut inner = self.lock();
        if let Some(worker) = inner.workers.get_mut(name) {
            worker.running.remove(&request);
            if worker.health == WorkerHealth::Busy && worker.has_capacity() {
                worker.health = WorkerHealth::Idle;
            }
        }
    }

    pub fn snapshot(&self, name: &str) -> Option<WorkerState> {
        self.lock().workers.get(name).cloned()
    }

    pub fn attached_workers(&self) -> Vec<String> {
        self.lock().workers.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(names: &[&str]) -> WorkerPool {
        let pool = WorkerPool::new(std::time::Duration::from_secs(60));
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        pool.set_known_workers(&names);
        pool
    }

    #[test]
    fn test_unknown_worker_refused() {
        let pool = pool_with(&["local1"]);
        assert!(!pool.attach("intruder", vec!["testy".to_string()], 1));
        assert!(pool.attach("local1", vec!["testy".to_string()], 1));
    }

    #[test]
    fn test_find_idle_eligible_filters_and_orders() {
        let pool = pool_with(&["w1", "w2", "w3"]);
        pool.attach("w1", vec!["other".to_string()], 1);
        pool.attach("w2", vec!["testy".to_string()], 1);
        pool.attach("w3", vec!["testy".to_string()], 1);

        let order = vec!["w1".to_string(), "w2".to_string(), "w3".to_string()];
        let eligible = pool.find_idle_eligible("testy", &order, NextWorkerPolicy::InOrder);
        assert_eq!(eligible, vec!["w2", "w3"]);
    }

    #[test]
    fn test_least_loaded_prefers_emptier_worker() {
        let pool = pool_with(&["w1", "w2"]);
        pool.attach("w1", vec!["testy".to_string()], 2);
        pool.attach("w2", vec!["testy".to_string()], 2);
        assert!(pool.reserve("w1", BuildRequestId(1)));

        let order = vec!["w1".to_string(), "w2".to_string()];
        let eligible = pool.find_idle_eligible("testy", &order, NextWorkerPolicy::LeastLoaded);
        assert_eq!(eligible, vec!["w2", "w1"]);
    }

    #[test]
    fn test_reserve_caps_at_max_builds() {
        let pool = pool_with(&["w1"]);
        pool.attach("w1", vec!["testy".to_string()], 1);
        assert!(pool.reserve("w1", BuildRequestId(1)));
        assert!(!pool.reserve("w1", BuildRequestId(2)));
        assert_eq!(
            pool.snapshot("w1").map(|w| w.health),
            Some(WorkerHealth::Busy)
        );

        pool.release_slot("w1", BuildRequestId(1));
        assert!(pool.reserve("w1", BuildRequestId(2)));
    }

    #[test]
    fn test_sweep_marks_only_idle_workers_lost() {
        let pool = pool_with(&["idle", "busy"]);
        pool.attach("idle", vec!["t".to_string()], 1);
        pool.attach("busy", vec!["t".to_string()], 1);
        assert!(pool.reserve("busy", BuildRequestId(1)));

        let later = Utc::now() + Duration::seconds(120);
        let lost = pool.sweep_lost(later);
        assert_eq!(lost, vec!["idle"]);
        assert_eq!(
            pool.snapshot("busy").map(|w| w.health),
            Some(WorkerHealth::Busy)
        );
        // Running counts are untouched by the sweep.
        assert_eq!(pool.snapshot("busy").map(|w| w.load()), Some(1));
    }

    #[test]
    fn test_lost_worker_needs_fresh_handshake() {
        let pool = pool_with(&["w1"]);
        pool.attach("w1", vec!["t".to_string()], 1);
        pool.sweep_lost(Utc::now() + Duration::seconds(120));

        // Heartbeats alone do not resurrect a lost worker.
        pool.heartbeat("w1");
        let order = vec!["w1".to_string()];
        assert!(
            pool.find_idle_eligible("t", &order, NextWorkerPolicy::InOrder)
                .is_empty()
        );

        pool.attach("w1", vec!["t".to_string()], 1);
        assert_eq!(
            pool.find_idle_eligible("t", &order, NextWorkerPolicy::InOrder),
            vec!["w1"]
        );
    }

    #[test]
    fn test_detach_returns_orphaned_requests() {
        let pool = pool_with(&["w1"]);
        pool.attach("w1", vec!["t".to_string()], 2);
        assert!(pool.reserve("w1", BuildRequestId(5)));
        assert!(pool.reserve("w1", BuildRequestId(6)));

        let mut orphaned = pool.detach("w1");
        orphaned.sort();
        assert_eq!(orphaned, vec![BuildRequestId(5), BuildRequestId(6)]);
        assert!(pool.detach("w1").is_empty());
    }
}
