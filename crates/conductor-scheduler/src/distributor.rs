//! The scheduling distributor: matches pending build requests to idle,
//! eligible, lock-available workers.
//!
//! `tick()` is the single entry point, invoked on every relevant event (new
//! request, worker idle, lock released, reconfiguration). Reentrant calls
//! coalesce: a call arriving while a pass is in flight schedules exactly one
//! follow-up pass instead of queueing unboundedly.
//!
//! The at-most-one-claim guarantee rests entirely on the store's atomic
//! compare-and-set; losing a claim race is an expected outcome that moves
//! the pass to the next candidate, never an error.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use conductor_core::config::{BuilderConfig, LockAccess, NextBuildPolicy};
use conductor_core::{
    BuildOutcome, BuildRequest, BuildRequestId, BuildSet, BuildSetId, BuildSpec, MasterId, Result,
    Store, WorkerTransport,
};

use crate::locks::LockRegistry;
use crate::pool::WorkerPool;

/// A build currently running under this master's claim.
#[derive(Debug, Clone)]
pub struct RunningBuild {
    pub request: BuildRequestId,
    pub buildset: BuildSetId,
    pub builder: String,
    pub worker: String,
    /// Builder-level locks held for the build's whole lifetime.
    builder_locks: Vec<LockAccess>,
    /// Step-scoped claims still outstanding: (holder id, access).
    step_claims: Vec<(String, LockAccess)>,
}

struct BuilderSlot {
    config: BuilderConfig,
    /// A draining builder accepts no new claims; it is dropped once its
    /// last running build finishes.
    draining: bool,
}

#[derive(Default)]
struct BuilderTable {
    slots: HashMap<String, BuilderSlot>,
    /// Round-robin offset so no builder is starved behind an earlier one.
    rotation: usize,
}

#[derive(Default)]
struct TickState {
    running: bool,
    pending: bool,
}

/// Outcome of one assignment attempt inside a pass.
enum Attempt {
    Started,
    /// No idle eligible worker: nothing else in this builder can start.
    NoWorker,
    /// A builder lock is unavailable: skip to the next builder.
    LocksUnavailable,
    /// Another pass or master won the claim: try the next request.
    ClaimLost,
    /// The worker did not acknowledge the start: try the next request.
    StartFailed,
}

pub struct Distributor {
    store: Arc<dyn Store>,
    transport: Arc<dyn WorkerTransport>,
    pool: Arc<WorkerPool>,
    locks: Arc<LockRegistry>,
    master: MasterId,
    builders: Mutex<BuilderTable>,
    tick_state: Mutex<TickState>,
    running: Mutex<HashMap<BuildRequestId, RunningBuild>>,
    /// Failed assignment attempts per request, against the retry budget.
    attempts: Mutex<HashMap<BuildRequestId, u32>>,
    start_build_retries: u32,
    /// Buildset completions flow out here; the master dispatches them to
    /// schedulers and blocked triggerers.
    completions: mpsc::UnboundedSender<(BuildSetId, BuildOutcome)>,
}

impl Distributor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn WorkerTransport>,
        pool: Arc<WorkerPool>,
        locks: Arc<LockRegistry>,
        master: MasterId,
        start_build_retries: u32,
        completions: mpsc::UnboundedSender<(BuildSetId, BuildOutcome)>,
    ) -> Self {
        Self {
            store,
            transport,
            pool,
            locks,
            master,
            builders: Mutex::new(BuilderTable::default()),
            tick_state: Mutex::new(TickState::default()),
            running: Mutex::new(HashMap::new()),
            attempts: Mutex::new(HashMap::new()),
            start_build_retries,
            completions,
        }
    }

    fn lock_builders(&self) -> MutexGuard<'_, BuilderTable> {
        match self.builders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, HashMap<BuildRequestId, RunningBuild>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Install the active builder set.
    ///
    /// Builders absent from `configs` drain: no new claims, running builds
    /// finish. A builder present under the same name has its configuration
    /// replaced wholesale; its running builds are unaffected.
    pub fn apply_builders(&self, configs: &[BuilderConfig]) {
        let mut table = self.lock_builders();
        let running = self.lock_running();

        for slot in table.slots.values_mut() {
            slot.draining = true;
        }
        for config in configs {
            table.slots.insert(
                config.name.clone(),
                BuilderSlot {
                    config: config.clone(),
                    draining: false,
                },
            );
        }
        // Draining builders with nothing running can go immediately.
        table.slots.retain(|name, slot| {
            !slot.draining || running.values().any(|build| &build.builder == name)
        });
    }

    pub fn is_builder_active(&self, name: &str) -> bool {
        self.lock_builders()
            .slots
            .get(name)
            .is_some_and(|slot| !slot.draining)
    }

    pub fn builder_config(&self, name: &str) -> Option<BuilderConfig> {
        self.lock_builders()
            .slots
            .get(name)
            .map(|slot| slot.config.clone())
    }

    pub fn running_builds(&self) -> Vec<RunningBuild> {
        self.lock_running().values().cloned().collect()
    }

    /// Run a scheduling pass, coalescing reentrant invocations.
    pub async fn tick(&self) -> Result<()> {
        {
            let mut state = match self.tick_state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.running {
                state.pending = true;
                return Ok(());
            }
            state.running = true;
        }

        loop {
            let pass = self.run_pass().await;
            if let Err(error) = &pass {
                warn!(%error, "scheduling pass failed");
            }
            let mut state = match self.tick_state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.pending {
                state.pending = false;
                continue;
            }
            state.running = false;
            return pass;
        }
    }

    /// One pass over every active builder, in rotated order for fairness.
    async fn run_pass(&self) -> Result<()> {
        let builders: Vec<BuilderConfig> = {
            let mut guard = self.lock_builders();
            let table = &mut *guard;
            let mut names: Vec<&String> = table
                .slots
                .iter()
                .filter(|(_, slot)| !slot.draining)
                .map(|(name, _)| name)
                .collect();
            names.sort();
            if names.is_empty() {
                return Ok(());
            }
            let offset = table.rotation % names.len();
            table.rotation = table.rotation.wrapping_add(1);
            names
                .iter()
                .cycle()
                .skip(offset)
                .take(names.len())
                .map(|name| table.slots[*name].config.clone())
                .collect()
        };

        let mut pending_seen = HashSet::new();
        for builder in builders {
            let mut requests = self.store.unclaimed_build_requests(&builder.name).await?;
            if let NextBuildPolicy::Priority = builder.next_build {
                requests.sort_by_key(|r| (std::cmp::Reverse(r.priority), r.id));
            }
            pending_seen.extend(requests.iter().map(|r| r.id));

            'requests: for request in requests {
                match self.try_start(&builder, &request).await? {
                    Attempt::Started => {}
                    Attempt::ClaimLost | Attempt::StartFailed => continue 'requests,
                    Attempt::NoWorker | Attempt::LocksUnavailable => break 'requests,
                }
            }
        }

        // Retry budgets for requests no longer pending here or running here
        // belong to requests another master finished; drop them.
        let mut live = pending_seen;
        live.extend(self.lock_running().keys().copied());
        match self.attempts.lock() {
            Ok(mut attempts) => attempts.retain(|id, _| live.contains(id)),
            Err(poisoned) => poisoned.into_inner().retain(|id, _| live.contains(id)),
        }
        Ok(())
    }

    /// Attempt to assign one request: reserve a slot, take builder locks,
    /// claim atomically, send the start command. Undone in reverse on any
    /// failure so a worker is never left busy for a claim that fell through.
    async fn try_start(&self, builder: &BuilderConfig, request: &BuildRequest) -> Result<Attempt> {
        let candidates = self.pool.find_idle_eligible(
            &builder.name,
            &builder.worker_names,
            builder.next_worker,
        );
        let Some(worker) = candidates
            .into_iter()
            .find(|candidate| self.pool.reserve(candidate, request.id))
        else {
            return Ok(Attempt::NoWorker);
        };

        let holder = builder_holder(request.id);
        if !self.acquire_all(&builder.locks, &worker, &holder) {
            self.pool.release_slot(&worker, request.id);
            debug!(
                builder = %builder.name,
                request = %request.id,
                "builder locks unavailable; leaving request pending"
            );
            return Ok(Attempt::LocksUnavailable);
        }

        if !self.store.claim_build_request(request.id, self.master).await? {
            self.release_all(&builder.locks, &worker, &holder);
            self.pool.release_slot(&worker, request.id);
            debug!(request = %request.id, "lost claim race");
            return Ok(Attempt::ClaimLost);
        }

        // The claim is ours now; a store failure past this point must give
        // back the slot, the locks, and the claim or they leak for good.
        let buildset = match self.fetch_start_context(request, &worker).await {
            Ok(buildset) => buildset,
            Err(error) => {
                warn!(
                    request = %request.id,
                    worker = %worker,
                    %error,
                    "store failed after claim; releasing"
                );
                self.release_all(&builder.locks, &worker, &holder);
                self.pool.release_slot(&worker, request.id);
                self.store.unclaim_build_request(request.id).await?;
                return Err(error);
            }
        };
        let spec = BuildSpec {
            request: request.id,
            buildset: request.buildset_id,
            builder_name: builder.name.clone(),
            factory: builder.factory.clone(),
            source_stamps: buildset.source_stamps,
            properties: buildset.properties,
        };

        self.lock_running().insert(
            request.id,
            RunningBuild {
                request: request.id,
                buildset: request.buildset_id,
                builder: builder.name.clone(),
                worker: worker.clone(),
                builder_locks: builder.locks.clone(),
                step_claims: Vec::new(),
            },
        );

        match self.transport.send_start_build(&worker, spec).await {
            Ok(()) => {
                info!(
                    builder = %builder.name,
                    request = %request.id,
                    worker = %worker,
                    "build started"
                );
                Ok(Attempt::Started)
            }
            Err(error) => {
                warn!(
                    request = %request.id,
                    worker = %worker,
                    %error,
                    "worker did not acknowledge start; releasing claim"
                );
                self.lock_running().remove(&request.id);
                self.release_all(&builder.locks, &worker, &holder);
                self.pool.release_slot(&worker, request.id);
                self.store.unclaim_build_request(request.id).await?;
                self.note_failed_attempt(request.id).await?;
                Ok(Attempt::StartFailed)
            }
        }
    }

    async fn fetch_start_context(
        &self,
        request: &BuildRequest,
        worker: &str,
    ) -> Result<BuildSet> {
        self.store.set_assigned_worker(request.id, worker).await?;
        self.store.get_buildset(request.buildset_id).await
    }

    /// Count a failed assignment against the retry budget; exhaustion
    /// completes the request with an infrastructure outcome.
    async fn note_failed_attempt(&self, request: BuildRequestId) -> Result<()> {
        let exhausted = {
            let mut attempts = match self.attempts.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let count = attempts.entry(request).or_insert(0);
            *count += 1;
            *count >= self.start_build_retries
        };
        if exhausted {
            warn!(
                request = %request,
                retries = self.start_build_retries,
                "assignment retries exhausted; failing request as infrastructure error"
            );
            // The CAS admits the completion even though we just unclaimed.
            if self.store.claim_build_request(request, self.master).await? {
                self.complete(request, BuildOutcome::Exception).await?;
            }
        }
        Ok(())
    }

    fn acquire_all(&self, accesses: &[LockAccess], worker: &str, holder: &str) -> bool {
        for (index, access) in accesses.iter().enumerate() {
            if !self.locks.try_acquire(&access.lock, worker, access.mode, holder) {
                for prior in &accesses[..index] {
                    self.locks.release(&prior.lock, worker, holder);
                }
                return false;
            }
        }
        true
    }

    fn release_all(&self, accesses: &[LockAccess], worker: &str, holder: &str) {
        for access in accesses {
            self.locks.release(&access.lock, worker, holder);
        }
    }

    /// Acquire step-scoped locks for a running build, lazily at step start.
    /// All-or-nothing; the step retries on a later lock release.
    pub fn acquire_step_locks(
        &self,
        request: BuildRequestId,
        step: &str,
        accesses: &[LockAccess],
    ) -> bool {
        let mut running = self.lock_running();
        let Some(build) = running.get_mut(&request) else {
            return false;
        };
        let holder = step_holder(request, step);
        let worker = build.worker.clone();
        for (index, access) in accesses.iter().enumerate() {
            if !self
                .locks
                .try_acquire(&access.lock, &worker, access.mode, &holder)
            {
                for prior in &accesses[..index] {
                    self.locks.release(&prior.lock, &worker, &holder);
                }
                return false;
            }
        }
        for access in accesses {
            build.step_claims.push((holder.clone(), access.clone()));
        }
        true
    }

    /// Release a step's locks at step end. Idempotent.
    pub fn release_step_locks(&self, request: BuildRequestId, step: &str) {
        let mut running = self.lock_running();
        let Some(build) = running.get_mut(&request) else {
            return;
        };
        let holder = step_holder(request, step);
        let worker = build.worker.clone();
        build.step_claims.retain(|(claim_holder, access)| {
            if claim_holder == &holder {
                self.locks.release(&access.lock, &worker, claim_holder);
                false
            } else {
                true
            }
        });
    }

    /// A build finished on its worker: release everything it held, record
    /// the result, and surface a buildset completion if this was the last
    /// child.
    pub async fn build_complete(
        &self,
        request: BuildRequestId,
        outcome: BuildOutcome,
    ) -> Result<()> {
        // Bind before the branch: the scrutinee guard would otherwise live
        // through the block, and drop_if_drained locks `running` again.
        let removed = self.lock_running().remove(&request);
        if let Some(build) = removed {
            let holder = builder_holder(request);
            // Any step claims still outstanding are released on this exit
            // path too; a lock claim never outlives its build.
            for (step_holder, access) in &build.step_claims {
                self.locks.release(&access.lock, &build.worker, step_holder);
            }
            self.release_all(&build.builder_locks, &build.worker, &holder);
            self.pool.release_slot(&build.worker, request);
            self.drop_if_drained(&build.builder);
        }
        self.complete(request, outcome).await
    }

    async fn complete(&self, request: BuildRequestId, outcome: BuildOutcome) -> Result<()> {
        match self.attempts.lock() {
            Ok(mut attempts) => {
                attempts.remove(&request);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&request);
            }
        }
        if let Some(completed) = self.store.record_build_result(request, outcome).await? {
            let _ = self.completions.send(completed);
        }
        Ok(())
    }

    /// A claimed build's worker vanished: release everything and return the
    /// request to the unclaimed pool for reassignment.
    pub async fn abandon(&self, request: BuildRequestId) -> Result<()> {
        let removed = self.lock_running().remove(&request);
        if let Some(build) = removed {
            let holder = builder_holder(request);
            for (step_holder, access) in &build.step_claims {
                self.locks.release(&access.lock, &build.worker, step_holder);
            }
            self.release_all(&build.builder_locks, &build.worker, &holder);
            self.pool.release_slot(&build.worker, request);
            self.drop_if_drained(&build.builder);
        }
        self.store.unclaim_build_request(request).await?;
        self.note_failed_attempt(request).await
    }

    /// Cancel a request: withdraw it if unclaimed, or deliver a cooperative
    /// cancellation to its worker if running. The claim and locks are only
    /// released once the worker confirms through `build_complete`.
    pub async fn cancel(&self, request: BuildRequestId) -> Result<()> {
        let worker = self
            .lock_running()
            .get(&request)
            .map(|build| build.worker.clone());
        match worker {
            Some(worker) => {
                info!(request = %request, worker = %worker, "delivering cancellation");
                self.transport.send_cancel_build(&worker, request).await
            }
            None => {
                let (cancelled, completed) = self.store.cancel_build_request(request).await?;
                if cancelled {
                    info!(request = %request, "unclaimed request withdrawn");
                }
                if let Some(completed) = completed {
                    let _ = self.completions.send(completed);
                }
                Ok(())
            }
        }
    }

    /// Reassert this master's claim leases. Run periodically.
    pub async fn reassert_claims(&self) -> Result<()> {
        let ids: Vec<BuildRequestId> = self.lock_running().keys().copied().collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.store.reassert_claims(self.master, &ids).await
    }

    #[cfg(test)]
    pub(crate) fn attempt_count(&self, request: BuildRequestId) -> Option<u32> {
        match self.attempts.lock() {
            Ok(attempts) => attempts.get(&request).copied(),
            Err(poisoned) => poisoned.into_inner().get(&request).copied(),
        }
    }

    /// Drop a draining builder once nothing of it remains running.
    fn drop_if_drained(&self, builder: &str) {
        let running = self.lock_running();
        let still_running = running.values().any(|build| build.builder == builder);
        drop(running);
        if still_running {
            return;
        }
        let mut table = self.lock_builders();
        if table
            .slots
            .get(builder)
            .is_some_and(|slot| slot.draining)
        {
            info!(builder = %builder, "drained builder removed");
            table.slots.remove(builder);
        }
    }
}

fn builder_holder(request: BuildRequestId) -> String {
    format!("request-{request}")
}

fn step_holder(request: BuildRequestId, step: &str) -> String {
    format!("request-{request}-step-{step}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use conductor_core::config::{LockConfig, LockMode, LockScope, NextWorkerPolicy};
    use conductor_core::{Change, ChangeId, Error, SourceStamp};
    use conductor_store::MemStore;
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Transport that records start commands and can be told to nack.
    #[derive(Default)]
    struct MockTransport {
        started: Mutex<Vec<(String, BuildRequestId)>>,
        cancelled: Mutex<Vec<(String, BuildRequestId)>>,
        nack: AtomicBool,
    }

    impl MockTransport {
        fn started(&self) -> Vec<(String, BuildRequestId)> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkerTransport for MockTransport {
        async fn send_start_build(&self, worker: &str, spec: BuildSpec) -> Result<()> {
            if self.nack.load(Ordering::SeqCst) {
                return Err(Error::Transport("nack".to_string()));
            }
            self.started
                .lock()
                .unwrap()
                .push((worker.to_string(), spec.request));
            Ok(())
        }

        async fn send_cancel_build(&self, worker: &str, request: BuildRequestId) -> Result<()> {
            self.cancelled
                .lock()
                .unwrap()
                .push((worker.to_string(), request));
            Ok(())
        }
    }

    struct Rig {
        store: Arc<MemStore>,
        transport: Arc<MockTransport>,
        pool: Arc<WorkerPool>,
        locks: Arc<LockRegistry>,
        distributor: Distributor,
        completions: mpsc::UnboundedReceiver<(BuildSetId, BuildOutcome)>,
    }

    fn rig() -> Rig {
        let store = Arc::new(MemStore::new());
        let transport = Arc::new(MockTransport::default());
        let pool = Arc::new(WorkerPool::new(std::time::Duration::from_secs(300)));
        let locks = Arc::new(LockRegistry::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let distributor = Distributor::new(
            store.clone(),
            transport.clone(),
            pool.clone(),
            locks.clone(),
            MasterId::new(),
            3,
            tx,
        );
        Rig {
            store,
            transport,
            pool,
            locks,
            distributor,
            completions: rx,
        }
    }

    fn builder(name: &str, workers: &[&str]) -> BuilderConfig {
        BuilderConfig {
            name: name.to_string(),
            factory: "factory".to_string(),
            worker_names: workers.iter().map(|s| s.to_string()).collect(),
            locks: vec![],
            next_worker: NextWorkerPolicy::InOrder,
            next_build: NextBuildPolicy::Fifo,
            category: None,
        }
    }

    fn attach(rig: &Rig, worker: &str, builders: &[&str], max_builds: usize) {
        let known: Vec<String> = rig
            .pool
            .attached_workers()
            .into_iter()
            .chain(std::iter::once(worker.to_string()))
            .collect();
        rig.pool.set_known_workers(&known);
        assert!(rig.pool.attach(
            worker,
            builders.iter().map(|s| s.to_string()).collect(),
            max_builds,
        ));
    }

    async fn submit(rig: &Rig, builders: &[&str]) -> (BuildSetId, Vec<BuildRequestId>) {
        rig.store
            .add_buildset(
                vec![SourceStamp::branch_tip("repo", "main")],
                "test".to_string(),
                Map::new(),
                &builders.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                0,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_basic_assignment() {
        let rig = rig();
        rig.distributor.apply_builders(&[builder("testy", &["local1"])]);
        attach(&rig, "local1", &["testy"], 1);

        let (_, requests) = submit(&rig, &["testy"]).await;
        rig.distributor.tick().await.unwrap();

        assert_eq!(rig.transport.started(), vec![("local1".to_string(), requests[0])]);
        let request = rig.store.get_build_request(requests[0]).await.unwrap();
        assert!(request.is_claimed());
        assert_eq!(request.assigned_worker.as_deref(), Some("local1"));
        assert_eq!(rig.distributor.running_builds().len(), 1);
    }

    #[tokio::test]
    async fn test_exclusive_lock_serializes_two_builders() {
        let mut rig = rig();
        rig.locks.configure(&[LockConfig {
            name: "lock1".to_string(),
            scope: LockScope::Global,
            max_count: 1,
        }]);
        let access = LockAccess {
            lock: "lock1".to_string(),
            mode: LockMode::Exclusive,
        };
        let mut b1 = builder("b1", &["w1"]);
        b1.locks.push(access.clone());
        let mut b2 = builder("b2", &["w2"]);
        b2.locks.push(access);
        rig.distributor.apply_builders(&[b1, b2]);
        attach(&rig, "w1", &["b1"], 1);
        attach(&rig, "w2", &["b2"], 1);

        submit(&rig, &["b1"]).await;
        submit(&rig, &["b2"]).await;
        rig.distributor.tick().await.unwrap();

        // Exactly one build runs while the other waits on the lock.
        let started = rig.transport.started();
        assert_eq!(started.len(), 1);

        let (_, first_request) = started[0].clone();
        rig.distributor
            .build_complete(first_request, BuildOutcome::Success)
            .await
            .unwrap();
        rig.distributor.tick().await.unwrap();
        assert_eq!(rig.transport.started().len(), 2);
        assert!(rig.completions.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_counting_lock_partial_admission() {
        let rig = rig();
        rig.locks.configure(&[LockConfig {
            name: "pool".to_string(),
            scope: LockScope::Global,
            max_count: 2,
        }]);
        let mut b = builder("b", &["w1", "w2", "w3"]);
        b.locks.push(LockAccess {
            lock: "pool".to_string(),
            mode: LockMode::Counting,
        });
        rig.distributor.apply_builders(&[b]);
        for worker in ["w1", "w2", "w3"] {
            attach(&rig, worker, &["b"], 1);
        }

        submit(&rig, &["b"]).await;
        submit(&rig, &["b"]).await;
        submit(&rig, &["b"]).await;
        rig.distributor.tick().await.unwrap();

        assert_eq!(rig.transport.started().len(), 2);
        assert_eq!(
            rig.store.unclaimed_build_requests("b").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_round_robin_is_fair_with_one_worker() {
        let rig = rig();
        rig.distributor
            .apply_builders(&[builder("alpha", &["w"]), builder("beta", &["w"])]);
        attach(&rig, "w", &["alpha", "beta"], 1);

        // A continuous supply for both builders, one shared single-slot
        // worker: both builders must get assignments over a bounded number
        // of ticks.
        for _ in 0..4 {
            submit(&rig, &["alpha"]).await;
            submit(&rig, &["beta"]).await;
        }

        let mut served = std::collections::HashSet::new();
        for _ in 0..4 {
            rig.distributor.tick().await.unwrap();
            if let Some(build) = rig.distributor.running_builds().first().cloned() {
                served.insert(build.builder.clone());
                rig.distributor
                    .build_complete(build.request, BuildOutcome::Success)
                    .await
                    .unwrap();
            }
        }
        assert!(served.contains("alpha"), "alpha starved: {served:?}");
        assert!(served.contains("beta"), "beta starved: {served:?}");
    }

    #[tokio::test]
    async fn test_fifo_within_builder() {
        let rig = rig();
        rig.distributor.apply_builders(&[builder("b", &["w"])]);
        attach(&rig, "w", &["b"], 1);

        let (_, first) = submit(&rig, &["b"]).await;
        let (_, _second) = submit(&rig, &["b"]).await;
        rig.distributor.tick().await.unwrap();

        assert_eq!(rig.transport.started(), vec![("w".to_string(), first[0])]);
    }

    #[tokio::test]
    async fn test_priority_policy_overrides_fifo() {
        let rig = rig();
        let mut b = builder("b", &["w"]);
        b.next_build = NextBuildPolicy::Priority;
        rig.distributor.apply_builders(&[b]);
        attach(&rig, "w", &["b"], 1);

        rig.store
            .add_buildset(
                vec![SourceStamp::branch_tip("repo", "main")],
                "low".to_string(),
                Map::new(),
                &["b".to_string()],
                0,
            )
            .await
            .unwrap();
        let (_, urgent) = rig
            .store
            .add_buildset(
                vec![SourceStamp::branch_tip("repo", "main")],
                "urgent".to_string(),
                Map::new(),
                &["b".to_string()],
                10,
            )
            .await
            .unwrap();

        rig.distributor.tick().await.unwrap();
        assert_eq!(rig.transport.started(), vec![("w".to_string(), urgent[0])]);
    }

    #[tokio::test]
    async fn test_lost_claim_race_moves_on() {
        let rig = rig();
        rig.distributor.apply_builders(&[builder("b", &["w"])]);
        attach(&rig, "w", &["b"], 2);

        let (_, first) = submit(&rig, &["b"]).await;
        let (_, second) = submit(&rig, &["b"]).await;

        // Another master grabs the first request between fetch and claim.
        assert!(
            rig.store
                .claim_build_request(first[0], MasterId::new())
                .await
                .unwrap()
        );

        rig.distributor.tick().await.unwrap();
        assert_eq!(rig.transport.started(), vec![("w".to_string(), second[0])]);
        // The worker slot reserved for the lost race was returned.
        assert_eq!(rig.pool.snapshot("w").map(|w| w.load()), Some(1));
    }

    #[tokio::test]
    async fn test_nack_releases_everything_and_retries() {
        let rig = rig();
        rig.distributor.apply_builders(&[builder("b", &["w"])]);
        attach(&rig, "w", &["b"], 1);
        rig.transport.nack.store(true, Ordering::SeqCst);

        let (_, requests) = submit(&rig, &["b"]).await;
        rig.distributor.tick().await.unwrap();

        let request = rig.store.get_build_request(requests[0]).await.unwrap();
        assert!(!request.is_claimed());
        assert!(request.result.is_none());
        assert_eq!(rig.pool.snapshot("w").map(|w| w.load()), Some(0));

        // Worker recovers; the next tick assigns successfully.
        rig.transport.nack.store(false, Ordering::SeqCst);
        rig.distributor.tick().await.unwrap();
        assert_eq!(rig.transport.started().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_with_infrastructure_outcome() {
        let mut rig = rig();
        rig.distributor.apply_builders(&[builder("b", &["w"])]);
        attach(&rig, "w", &["b"], 1);
        rig.transport.nack.store(true, Ordering::SeqCst);

        let (buildset, requests) = submit(&rig, &["b"]).await;
        for _ in 0..3 {
            rig.distributor.tick().await.unwrap();
        }

        let request = rig.store.get_build_request(requests[0]).await.unwrap();
        assert_eq!(request.result, Some(BuildOutcome::Exception));
        assert_eq!(
            rig.completions.try_recv().unwrap(),
            (buildset, BuildOutcome::Exception)
        );
    }

    #[tokio::test]
    async fn test_cancel_unclaimed_withdraws() {
        let mut rig = rig();
        rig.distributor.apply_builders(&[builder("b", &["w"])]);

        let (buildset, requests) = submit(&rig, &["b"]).await;
        rig.distributor.cancel(requests[0]).await.unwrap();

        let request = rig.store.get_build_request(requests[0]).await.unwrap();
        assert_eq!(request.result, Some(BuildOutcome::Cancelled));
        assert_eq!(
            rig.completions.try_recv().unwrap(),
            (buildset, BuildOutcome::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_cancel_running_is_cooperative() {
        let rig = rig();
        rig.distributor.apply_builders(&[builder("b", &["w"])]);
        attach(&rig, "w", &["b"], 1);
        let (_, requests) = submit(&rig, &["b"]).await;
        rig.distributor.tick().await.unwrap();

        rig.distributor.cancel(requests[0]).await.unwrap();
        // Claim and locks stay until the worker confirms termination.
        assert_eq!(rig.distributor.running_builds().len(), 1);
        assert_eq!(
            rig.transport.cancelled.lock().unwrap().clone(),
            vec![("w".to_string(), requests[0])]
        );

        rig.distributor
            .build_complete(requests[0], BuildOutcome::Cancelled)
            .await
            .unwrap();
        assert!(rig.distributor.running_builds().is_empty());
    }

    #[tokio::test]
    async fn test_step_locks_acquired_lazily_and_released_on_completion() {
        let rig = rig();
        rig.locks.configure(&[LockConfig {
            name: "db".to_string(),
            scope: LockScope::Global,
            max_count: 1,
        }]);
        rig.distributor.apply_builders(&[builder("b", &["w"])]);
        attach(&rig, "w", &["b"], 1);
        let (_, requests) = submit(&rig, &["b"]).await;
        rig.distributor.tick().await.unwrap();

        // The builder holds nothing on "db" until a step asks for it.
        assert_eq!(rig.locks.holder_count("db", ""), 0);
        let access = [LockAccess {
            lock: "db".to_string(),
            mode: LockMode::Exclusive,
        }];
        assert!(rig.distributor.acquire_step_locks(requests[0], "migrate", &access));
        assert_eq!(rig.locks.holder_count("db", ""), 1);
        assert!(!rig.distributor.acquire_step_locks(requests[0], "other", &access));

        // Completion releases the step claim even without an explicit
        // release from the (crashed) step.
        rig.distributor
            .build_complete(requests[0], BuildOutcome::Failure)
            .await
            .unwrap();
        assert_eq!(rig.locks.holder_count("db", ""), 0);
    }

    /// Store that can be told to fail its next `get_buildset` call.
    struct FlakyStore {
        inner: MemStore,
        fail_get_buildset: AtomicBool,
    }

    #[async_trait]
    impl Store for FlakyStore {
        async fn add_change(&self, change: Change) -> Result<ChangeId> {
            self.inner.add_change(change).await
        }

        async fn changes_since(&self, since: ChangeId) -> Result<Vec<Change>> {
            self.inner.changes_since(since).await
        }

        async fn add_buildset(
            &self,
            source_stamps: Vec<SourceStamp>,
            reason: String,
            properties: Map<String, serde_json::Value>,
            builder_names: &[String],
            priority: i32,
        ) -> Result<(BuildSetId, Vec<BuildRequestId>)> {
            self.inner
                .add_buildset(source_stamps, reason, properties, builder_names, priority)
                .await
        }

        async fn unclaimed_build_requests(&self, builder_name: &str) -> Result<Vec<BuildRequest>> {
            self.inner.unclaimed_build_requests(builder_name).await
        }

        async fn claim_build_request(&self, id: BuildRequestId, master: MasterId) -> Result<bool> {
            self.inner.claim_build_request(id, master).await
        }

        async fn set_assigned_worker(&self, id: BuildRequestId, worker: &str) -> Result<()> {
            self.inner.set_assigned_worker(id, worker).await
        }

        async fn reassert_claims(&self, master: MasterId, ids: &[BuildRequestId]) -> Result<()> {
            self.inner.reassert_claims(master, ids).await
        }

        async fn unclaim_build_request(&self, id: BuildRequestId) -> Result<()> {
            self.inner.unclaim_build_request(id).await
        }

        async fn reclaim_expired_claims(&self, cutoff: DateTime<Utc>) -> Result<u64> {
            self.inner.reclaim_expired_claims(cutoff).await
        }

        async fn record_build_result(
            &self,
            id: BuildRequestId,
            outcome: BuildOutcome,
        ) -> Result<Option<(BuildSetId, BuildOutcome)>> {
            self.inner.record_build_result(id, outcome).await
        }

        async fn cancel_build_request(
            &self,
            id: BuildRequestId,
        ) -> Result<(bool, Option<(BuildSetId, BuildOutcome)>)> {
            self.inner.cancel_build_request(id).await
        }

        async fn get_build_request(&self, id: BuildRequestId) -> Result<BuildRequest> {
            self.inner.get_build_request(id).await
        }

        async fn get_buildset(&self, id: BuildSetId) -> Result<BuildSet> {
            if self.fail_get_buildset.swap(false, Ordering::SeqCst) {
                return Err(Error::Internal("store offline".to_string()));
            }
            self.inner.get_buildset(id).await
        }

        async fn scheduler_last_change(&self, scheduler_name: &str) -> Result<Option<ChangeId>> {
            self.inner.scheduler_last_change(scheduler_name).await
        }

        async fn set_scheduler_last_change(
            &self,
            scheduler_name: &str,
            change: ChangeId,
        ) -> Result<()> {
            self.inner.set_scheduler_last_change(scheduler_name, change).await
        }
    }

    #[tokio::test]
    async fn test_store_failure_after_claim_releases_slot_locks_and_claim() {
        let store = Arc::new(FlakyStore {
            inner: MemStore::new(),
            fail_get_buildset: AtomicBool::new(false),
        });
        let transport = Arc::new(MockTransport::default());
        let pool = Arc::new(WorkerPool::new(std::time::Duration::from_secs(300)));
        let locks = Arc::new(LockRegistry::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let distributor = Distributor::new(
            store.clone(),
            transport.clone(),
            pool.clone(),
            locks.clone(),
            MasterId::new(),
            3,
            tx,
        );

        locks.configure(&[LockConfig {
            name: "lock1".to_string(),
            scope: LockScope::Global,
            max_count: 1,
        }]);
        let mut b = builder("b", &["w"]);
        b.locks.push(LockAccess {
            lock: "lock1".to_string(),
            mode: LockMode::Exclusive,
        });
        distributor.apply_builders(&[b]);
        pool.set_known_workers(&["w".to_string()]);
        assert!(pool.attach("w", vec!["b".to_string()], 1));

        let (_, requests) = store
            .inner
            .add_buildset(
                vec![SourceStamp::branch_tip("repo", "main")],
                "test".to_string(),
                Map::new(),
                &["b".to_string()],
                0,
            )
            .await
            .unwrap();

        store.fail_get_buildset.store(true, Ordering::SeqCst);
        assert!(distributor.tick().await.is_err());

        // Nothing the failed start touched is still held.
        assert!(distributor.running_builds().is_empty());
        assert_eq!(pool.snapshot("w").map(|w| w.load()), Some(0));
        assert_eq!(locks.holder_count("lock1", ""), 0);
        let request = store.inner.get_build_request(requests[0]).await.unwrap();
        assert!(!request.is_claimed());

        // The store recovers; the next tick assigns normally.
        distributor.tick().await.unwrap();
        assert_eq!(transport.started(), vec![("w".to_string(), requests[0])]);
    }

    #[tokio::test]
    async fn test_retry_budget_dropped_when_request_finishes_elsewhere() {
        let rig = rig();
        rig.distributor.apply_builders(&[builder("b", &["w"])]);
        attach(&rig, "w", &["b"], 1);
        rig.transport.nack.store(true, Ordering::SeqCst);

        let (_, requests) = submit(&rig, &["b"]).await;
        rig.distributor.tick().await.unwrap();
        assert_eq!(rig.distributor.attempt_count(requests[0]), Some(1));

        // Another master claims the request and finishes it.
        assert!(
            rig.store
                .claim_build_request(requests[0], MasterId::new())
                .await
                .unwrap()
        );
        rig.store
            .record_build_result(requests[0], BuildOutcome::Success)
            .await
            .unwrap();

        rig.distributor.tick().await.unwrap();
        assert_eq!(rig.distributor.attempt_count(requests[0]), None);
    }

    #[tokio::test]
    async fn test_abandon_returns_request_to_pool() {
        let rig = rig();
        rig.distributor.apply_builders(&[builder("b", &["w"])]);
        attach(&rig, "w", &["b"], 1);
        let (_, requests) = submit(&rig, &["b"]).await;
        rig.distributor.tick().await.unwrap();

        rig.distributor.abandon(requests[0]).await.unwrap();
        let request = rig.store.get_build_request(requests[0]).await.unwrap();
        assert!(!request.is_claimed());
        assert!(request.result.is_none());
        assert_eq!(rig.pool.snapshot("w").map(|w| w.load()), Some(0));
    }
}
