//! The assembled build master.
//!
//! Owns the store and transport handles, the worker pool, the lock
//! registry, the distributor, and the scheduler set; exposes the control
//! surface (`force_build`, `trigger`, `cancel_build_request`,
//! `reconfigure`, `builder_status`) and the ingress methods the
//! change-feed and worker-transport glue call into.
//!
//! All cross-references go through this registry by name or id; builders,
//! workers, and locks never hold pointers to each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use conductor_core::config::{MasterConfig, Tuning};
use conductor_core::{
    BuildOutcome, BuildRequestId, BuildSetId, Change, ChangeId, Error, MasterId, Result,
    SourceStamp, Store, WorkerEvent, WorkerTransport,
};

use crate::distributor::Distributor;
use crate::locks::LockRegistry;
use crate::pool::WorkerPool;
use crate::reconfig::{self, ReconfigOutcome};
use crate::schedulers::{ActiveScheduler, StateMap};

/// Pending/running view of one builder, for the status surface.
#[derive(Debug, Clone)]
pub struct BuilderStatus {
    pub pending: Vec<BuildRequestId>,
    pub running: Vec<(BuildRequestId, String)>,
}

#[derive(Default)]
struct ReconfigState {
    in_progress: bool,
    /// A reconfiguration requested mid-flight; exactly one is kept.
    pending: Option<MasterConfig>,
}

pub struct BuildMaster {
    master_id: MasterId,
    tuning: Tuning,
    store: Arc<dyn Store>,
    pool: Arc<WorkerPool>,
    locks: Arc<LockRegistry>,
    distributor: Arc<Distributor>,
    config: Mutex<MasterConfig>,
    schedulers: Mutex<Vec<Arc<ActiveScheduler>>>,
    states: StateMap,
    completions: Mutex<mpsc::UnboundedReceiver<(BuildSetId, BuildOutcome)>>,
    /// Callers blocked in `wait_for_buildset`.
    waiters: Mutex<Vec<(BuildSetId, oneshot::Sender<BuildOutcome>)>>,
    reconfig: Mutex<ReconfigState>,
}

impl BuildMaster {
    /// Build a master from a validated configuration. The configuration is
    /// checked up front; a rejected config never constructs a master.
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn WorkerTransport>,
        config: MasterConfig,
        tuning: Tuning,
    ) -> Result<Self> {
        validate(&config)?;

        let master_id = MasterId::new();
        let pool = Arc::new(WorkerPool::new(tuning.heartbeat_timeout));
        let locks = Arc::new(LockRegistry::new());
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let distributor = Arc::new(Distributor::new(
            store.clone(),
            transport,
            pool.clone(),
            locks.clone(),
            master_id,
            tuning.start_build_retries,
            completions_tx,
        ));
        let states: StateMap = Arc::new(Mutex::new(HashMap::new()));

        locks.configure(&config.locks);
        let worker_names: Vec<String> =
            config.workers.iter().map(|w| w.name.clone()).collect();
        pool.set_known_workers(&worker_names);
        distributor.apply_builders(&config.builders);

        let schedulers = config
            .schedulers
            .iter()
            .map(|sc| Arc::new(ActiveScheduler::new(sc.clone(), store.clone(), states.clone())))
            .collect();

        info!(master = %master_id, "build master constructed");
        Ok(Self {
            master_id,
            tuning,
            store,
            pool,
            locks,
            distributor,
            config: Mutex::new(config),
            schedulers: Mutex::new(schedulers),
            states,
            completions: Mutex::new(completions_rx),
            waiters: Mutex::new(Vec::new()),
            reconfig: Mutex::new(ReconfigState::default()),
        })
    }

    pub fn master_id(&self) -> MasterId {
        self.master_id
    }

    pub fn lock_registry(&self) -> &Arc<LockRegistry> {
        &self.locks
    }

    pub fn distributor(&self) -> &Arc<Distributor> {
        &self.distributor
    }

    /// Bring the master online: run the reclaim sweep *before* serving any
    /// scheduling, then activate schedulers and run the first pass.
    pub async fn activate(&self) -> Result<()> {
        self.reclaim_sweep().await?;
        for scheduler in self.snapshot_schedulers() {
            scheduler.on_activate().await?;
        }
        self.distributor.tick().await
    }

    /// Return claims abandoned by dead masters (including this process's
    /// previous incarnation) to the unclaimed pool.
    pub async fn reclaim_sweep(&self) -> Result<u64> {
        let lease = self.tuning.reclaim_interval * self.tuning.unclaimed_build_factor;
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| Error::Internal(format!("reclaim lease out of range: {e}")))?;
        let cutoff = chrono::Utc::now() - lease;
        let reclaimed = self.store.reclaim_expired_claims(cutoff).await?;
        if reclaimed > 0 {
            info!(reclaimed, "reclaim sweep returned abandoned claims");
            self.distributor.tick().await?;
        }
        Ok(reclaimed)
    }

    /// Ingress for the change feed: record the change and offer it to every
    /// scheduler.
    pub async fn handle_new_change(&self, mut change: Change) -> Result<ChangeId> {
        let id = self.store.add_change(change.clone()).await?;
        change.id = id;

        let mut submitted = false;
        for scheduler in self.snapshot_schedulers() {
            match scheduler.on_new_change(&change).await {
                Ok(buildsets) => submitted |= !buildsets.is_empty(),
                Err(error) => {
                    error!(scheduler = %scheduler.name(), %error, "change delivery failed");
                }
            }
        }
        if submitted {
            self.distributor.tick().await?;
        }
        Ok(id)
    }

    /// Ingress for worker transport events.
    pub async fn handle_worker_event(&self, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::Connected {
                name,
                capabilities,
                max_builds,
            } => {
                if self.pool.attach(&name, capabilities, max_builds) {
                    self.distributor.tick().await?;
                }
            }
            WorkerEvent::Heartbeat { name } => self.pool.heartbeat(&name),
            WorkerEvent::Disconnected { name } => {
                for request in self.pool.detach(&name) {
                    self.distributor.abandon(request).await?;
                }
                self.dispatch_completions().await?;
                self.distributor.tick().await?;
            }
            WorkerEvent::BuildComplete {
                request, outcome, ..
            } => {
                self.distributor.build_complete(request, outcome).await?;
                self.dispatch_completions().await?;
                self.distributor.tick().await?;
            }
        }
        Ok(())
    }

    /// Submit a one-off buildset against a single builder.
    pub async fn force_build(
        &self,
        builder_name: &str,
        properties: HashMap<String, serde_json::Value>,
    ) -> Result<BuildSetId> {
        if !self.distributor.is_builder_active(builder_name) {
            return Err(Error::NotFound(format!("builder '{builder_name}'")));
        }
        let (buildset, _) = self
            .store
            .add_buildset(
                vec![SourceStamp::branch_tip("", "")],
                "force build".to_string(),
                properties,
                std::slice::from_ref(&builder_name.to_string()),
                0,
            )
            .await?;
        info!(builder = builder_name, buildset = %buildset, "build forced");
        self.distributor.tick().await?;
        Ok(buildset)
    }

    /// Invoke a triggerable scheduler by name. With `wait`, the returned
    /// receiver resolves to the aggregate outcome of the triggered
    /// buildset, worst-case-wins across its requests.
    pub async fn trigger(
        &self,
        scheduler_name: &str,
        source_stamps: Vec<SourceStamp>,
        properties: HashMap<String, serde_json::Value>,
        wait: bool,
    ) -> Result<(BuildSetId, Option<oneshot::Receiver<BuildOutcome>>)> {
        let scheduler = self
            .snapshot_schedulers()
            .into_iter()
            .find(|s| s.name() == scheduler_name)
            .ok_or_else(|| Error::NotFound(format!("scheduler '{scheduler_name}'")))?;
        let result = scheduler.trigger(source_stamps, properties, wait).await?;
        self.distributor.tick().await?;
        Ok(result)
    }

    /// Block on a buildset's aggregate outcome. Resolves immediately if the
    /// buildset already completed.
    pub async fn wait_for_buildset(
        &self,
        buildset: BuildSetId,
    ) -> Result<oneshot::Receiver<BuildOutcome>> {
        let record = self.store.get_buildset(buildset).await?;
        let (tx, rx) = oneshot::channel();
        if let Some(outcome) = record.result {
            // Flush anyone whose registration raced an earlier dispatch.
            self.resolve_waiters(buildset, outcome);
            let _ = tx.send(outcome);
            return Ok(rx);
        }
        lock(&self.waiters).push((buildset, tx));
        // A completion dispatched between the read above and the push finds
        // no waiter; re-check and resolve in that window ourselves.
        if let Some(outcome) = self.store.get_buildset(buildset).await?.result {
            self.resolve_waiters(buildset, outcome);
        }
        Ok(rx)
    }

    pub async fn cancel_build_request(&self, request: BuildRequestId) -> Result<()> {
        self.distributor.cancel(request).await?;
        self.dispatch_completions().await
    }

    pub async fn builder_status(&self, builder_name: &str) -> Result<BuilderStatus> {
        if self.distributor.builder_config(builder_name).is_none() {
            return Err(Error::NotFound(format!("builder '{builder_name}'")));
        }
        let pending = self
            .store
            .unclaimed_build_requests(builder_name)
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();
        let running = self
            .distributor
            .running_builds()
            .into_iter()
            .filter(|b| b.builder == builder_name)
            .map(|b| (b.request, b.worker))
            .collect();
        Ok(BuilderStatus { pending, running })
    }

    /// Apply a new configuration to the live system.
    ///
    /// Validation failures reject the whole attempt atomically, leaving the
    /// prior configuration running. A request arriving while another
    /// reconfiguration is in flight is coalesced into one follow-up run.
    /// Apply-phase failures do not roll back: the outcome's warnings flag
    /// the system as partially reconfigured.
    pub async fn reconfigure(&self, new_config: MasterConfig) -> Result<ReconfigOutcome> {
        {
            let mut state = lock(&self.reconfig);
            if state.in_progress {
                state.pending = Some(new_config);
                let mut outcome = ReconfigOutcome::default();
                outcome
                    .warnings
                    .push("coalesced behind an in-progress reconfiguration".to_string());
                return Ok(outcome);
            }
            state.in_progress = true;
        }

        let mut config = new_config;
        loop {
            let result = self.apply_config(config).await;
            let mut state = lock(&self.reconfig);
            match state.pending.take() {
                Some(next) => {
                    config = next;
                }
                None => {
                    state.in_progress = false;
                    return result;
                }
            }
        }
    }

    async fn apply_config(&self, new_config: MasterConfig) -> Result<ReconfigOutcome> {
        validate(&new_config)?;

        let old_config = lock(&self.config).clone();
        let diff = reconfig::diff(&old_config, &new_config);
        let mut outcome = ReconfigOutcome::from_diff(&diff);
        if diff.is_noop() {
            info!("reconfiguration is a no-op");
            return Ok(outcome);
        }
        info!(
            added = outcome.added,
            removed = outcome.removed,
            replaced = outcome.replaced,
            "applying reconfiguration"
        );

        // Locks first: shrunk capacities stop admitting immediately while
        // existing holders drain.
        self.locks.configure(&new_config.locks);

        let worker_names: Vec<String> =
            new_config.workers.iter().map(|w| w.name.clone()).collect();
        for request in self.pool.set_known_workers(&worker_names) {
            if let Err(error) = self.distributor.abandon(request).await {
                outcome
                    .warnings
                    .push(format!("failed to release claim on request {request}: {error}"));
            }
        }

        // Removed builders drain; replaced ones take effect for new claims
        // only, running builds are untouched.
        self.distributor.apply_builders(&new_config.builders);

        // Schedulers: unchanged instances keep running untouched; added and
        // replaced ones start fresh (picking up retained state by name);
        // removed ones stop, their retained state kept in case they return.
        let previous = self.snapshot_schedulers();
        let mut next = Vec::with_capacity(new_config.schedulers.len());
        for scheduler_config in &new_config.schedulers {
            let unchanged = diff
                .schedulers
                .unchanged
                .iter()
                .any(|name| name == &scheduler_config.name);
            if unchanged {
                if let Some(existing) = previous
                    .iter()
                    .find(|s| s.name() == scheduler_config.name)
                {
                    next.push(existing.clone());
                    continue;
                }
            }
            let scheduler = Arc::new(ActiveScheduler::new(
                scheduler_config.clone(),
                self.store.clone(),
                self.states.clone(),
            ));
            if let Err(error) = scheduler.on_activate().await {
                // Deliberate asymmetry: apply-phase failures are surfaced,
                // not rolled back.
                warn!(
                    scheduler = %scheduler_config.name,
                    %error,
                    "scheduler failed to start; system is partially reconfigured"
                );
                outcome.warnings.push(format!(
                    "scheduler '{}' failed to start: {error}",
                    scheduler_config.name
                ));
                continue;
            }
            next.push(scheduler);
        }
        *lock(&self.schedulers) = next;
        *lock(&self.config) = new_config;

        if !outcome.warnings.is_empty() {
            warn!(
                warnings = outcome.warnings.len(),
                "system partially reconfigured"
            );
        }

        // New builders or workers may unblock previously stuck requests.
        self.distributor.tick().await?;
        Ok(outcome)
    }

    /// Run every scheduler's timer hook once and dispatch any completions.
    pub async fn poll_once(&self) -> Result<()> {
        let mut submitted = false;
        for scheduler in self.snapshot_schedulers() {
            match scheduler.poll().await {
                Ok(buildsets) => submitted |= !buildsets.is_empty(),
                Err(error) => {
                    error!(scheduler = %scheduler.name(), %error, "scheduler poll failed");
                }
            }
        }
        self.dispatch_completions().await?;
        if submitted {
            self.distributor.tick().await?;
        }
        Ok(())
    }

    /// Spawn the background loops: scheduler polling, claim-lease
    /// maintenance, and the worker heartbeat sweep.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let poll_master = self.clone();
        let poll_loop = tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll_master.tuning.poll_interval);
            loop {
                interval.tick().await;
                if let Err(error) = poll_master.poll_once().await {
                    error!(%error, "poll loop iteration failed");
                }
            }
        });

        let lease_master = self.clone();
        let lease_loop = tokio::spawn(async move {
            let mut interval = tokio::time::interval(lease_master.tuning.reclaim_interval);
            loop {
                interval.tick().await;
                if let Err(error) = lease_master.distributor.reassert_claims().await {
                    error!(%error, "claim lease reassertion failed");
                }
                if let Err(error) = lease_master.reclaim_sweep().await {
                    error!(%error, "reclaim sweep failed");
                }
            }
        });

        let sweep_master = self.clone();
        let heartbeat_loop = tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_master.tuning.heartbeat_timeout / 4);
            loop {
                interval.tick().await;
                let lost = sweep_master.pool.sweep_lost(chrono::Utc::now());
                if !lost.is_empty() {
                    warn!(lost = lost.len(), "workers marked lost");
                }
            }
        });

        vec![poll_loop, lease_loop, heartbeat_loop]
    }

    fn snapshot_schedulers(&self) -> Vec<Arc<ActiveScheduler>> {
        lock(&self.schedulers).clone()
    }

    /// Drain buildset completions and fan them out to the schedulers so
    /// triggerable waiters resolve.
    async fn dispatch_completions(&self) -> Result<()> {
        let completed: Vec<(BuildSetId, BuildOutcome)> = {
            let mut receiver = lock(&self.completions);
            let mut batch = Vec::new();
            while let Ok(completion) = receiver.try_recv() {
                batch.push(completion);
            }
            batch
        };
        for (buildset, outcome) in completed {
            self.resolve_waiters(buildset, outcome);
            for scheduler in self.snapshot_schedulers() {
                scheduler.on_upstream_complete(buildset, outcome).await?;
            }
        }
        Ok(())
    }

    /// Resolve every registered waiter for one completed buildset.
    fn resolve_waiters(&self, buildset: BuildSetId, outcome: BuildOutcome) {
        let resolved = {
            let mut waiters = lock(&self.waiters);
            let mut resolved = Vec::new();
            let remaining = std::mem::take(&mut *waiters);
            for (waiting_on, sender) in remaining {
                if waiting_on == buildset {
                    resolved.push(sender);
                } else {
                    waiters.push((waiting_on, sender));
                }
            }
            resolved
        };
        for sender in resolved {
            let _ = sender.send(outcome);
        }
    }
}

fn validate(config: &MasterConfig) -> Result<()> {
    conductor_config::validate(config).map_err(|errors| {
        Error::ConfigRejected(errors.iter().map(|e| e.to_string()).collect())
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
