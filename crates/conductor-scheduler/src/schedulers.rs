//! Trigger schedulers: the reactive units that decide when to submit new
//! buildsets.
//!
//! A closed set of variants shares one contract: `on_activate`,
//! `on_new_change`, `on_upstream_complete`, and `poll`. The variant is
//! selected at configuration-load time from [`SchedulerKind`].
//!
//! Reconfiguration is tolerant: accumulated state (last processed change,
//! pending stabilization set, timers, trigger waiters) lives in a shared
//! map keyed by scheduler name, so a scheduler replaced under the same name
//! keeps it, and a removed scheduler's state survives in case it reappears.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info};

use conductor_core::config::{SchedulerConfig, SchedulerKind};
use conductor_core::{
    BuildOutcome, BuildSetId, Change, ChangeId, Error, Result, SourceStamp, Store,
};

/// Per-scheduler state retained across reconfigurations, keyed by name.
#[derive(Default)]
pub struct RetainedState {
    /// Highest change id this scheduler has fully processed.
    pub last_change: Option<ChangeId>,
    /// Changes accumulated during the stabilization window.
    pub pending_changes: Vec<Change>,
    /// When the stabilization window closes.
    pub stable_deadline: Option<Instant>,
    /// Next periodic fire time.
    pub next_fire: Option<Instant>,
    /// Most recent change observed, used for "latest known stamp".
    pub latest_change: Option<Change>,
    /// Callers blocked on buildsets this scheduler triggered.
    pub waiters: Vec<(BuildSetId, oneshot::Sender<BuildOutcome>)>,
}

/// Shared retained-state table. Owned by the master, outliving any one
/// scheduler instance.
pub type StateMap = Arc<Mutex<HashMap<String, RetainedState>>>;

/// One configured, running scheduler.
pub struct ActiveScheduler {
    pub config: SchedulerConfig,
    store: Arc<dyn Store>,
    states: StateMap,
}

impl ActiveScheduler {
    pub fn new(config: SchedulerConfig, store: Arc<dyn Store>, states: StateMap) -> Self {
        Self {
            config,
            store,
            states,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut RetainedState) -> R) -> R {
        let mut states = lock(&self.states);
        f(states.entry(self.config.name.clone()).or_default())
    }

    /// Called when the scheduler starts (first config or replacement).
    pub async fn on_activate(&self) -> Result<()> {
        match &self.config.kind {
            SchedulerKind::SingleBranch { .. } => {
                // Resume from the persisted cursor so a restart neither
                // re-triggers nor silently misses changes.
                let persisted = self.store.scheduler_last_change(self.name()).await?;
                self.with_state(|state| {
                    if state.last_change.is_none() {
                        state.last_change = persisted;
                    }
                });
            }
            SchedulerKind::Periodic { interval } => {
                let interval = *interval;
                self.with_state(|state| {
                    if state.next_fire.is_none() {
                        state.next_fire = Some(Instant::now() + interval);
                    }
                });
            }
            SchedulerKind::Triggerable | SchedulerKind::Force => {}
        }
        Ok(())
    }

    /// Deliver a new change. Returns buildsets submitted as a result.
    pub async fn on_new_change(&self, change: &Change) -> Result<Vec<BuildSetId>> {
        match &self.config.kind {
            SchedulerKind::SingleBranch {
                branch,
                category,
                stable_delay,
            } => {
                if let Some(branch) = branch {
                    if &change.branch != branch {
                        return Ok(Vec::new());
                    }
                }
                if let Some(category) = category {
                    if change.category.as_ref() != Some(category) {
                        return Ok(Vec::new());
                    }
                }
                let stable_delay = *stable_delay;
                let ready = self.with_state(|state| {
                    if state.last_change.is_some_and(|last| change.id <= last) {
                        // Already processed before a restart.
                        return false;
                    }
                    state.latest_change = Some(change.clone());
                    state.pending_changes.push(change.clone());
                    if stable_delay.is_zero() {
                        true
                    } else {
                        state.stable_deadline = Some(Instant::now() + stable_delay);
                        debug!(
                            scheduler = %self.config.name,
                            change = %change.id,
                            "stabilization window extended"
                        );
                        false
                    }
                });
                if ready {
                    self.submit_pending().await.map(|id| id.into_iter().collect())
                } else {
                    Ok(Vec::new())
                }
            }
            SchedulerKind::Periodic { .. } => {
                // Periodic schedulers ignore changes for triggering but
                // track the latest stamp to build.
                self.with_state(|state| state.latest_change = Some(change.clone()));
                Ok(Vec::new())
            }
            SchedulerKind::Triggerable | SchedulerKind::Force => Ok(Vec::new()),
        }
    }

    /// A buildset completed somewhere in the system. Triggerable schedulers
    /// unblock any caller waiting on it, propagating the aggregate result.
    pub async fn on_upstream_complete(
        &self,
        buildset: BuildSetId,
        outcome: BuildOutcome,
    ) -> Result<()> {
        let senders = self.with_state(|state| {
            let mut senders = Vec::new();
            let mut kept = Vec::new();
            for (waiting_on, sender) in state.waiters.drain(..) {
                if waiting_on == buildset {
                    senders.push(sender);
                } else {
                    kept.push((waiting_on, sender));
                }
            }
            state.waiters = kept;
            senders
        });
        for sender in senders {
            let _ = sender.send(outcome);
        }
        Ok(())
    }

    /// Timer-driven hook, run periodically by the master.
    pub async fn poll(&self) -> Result<Vec<BuildSetId>> {
        match &self.config.kind {
            SchedulerKind::SingleBranch { .. } => {
                let due = self.with_state(|state| {
                    state.stable_deadline.is_some_and(|deadline| {
                        deadline <= Instant::now() && !state.pending_changes.is_empty()
                    })
                });
                if due {
                    self.submit_pending().await.map(|id| id.into_iter().collect())
                } else {
                    Ok(Vec::new())
                }
            }
            SchedulerKind::Periodic { interval } => {
                let interval = *interval;
                let stamp = self.with_state(|state| {
                    let now = Instant::now();
                    match state.next_fire {
                        Some(fire) if fire <= now => {
                            state.next_fire = Some(now + interval);
                            Some(
                                state
                                    .latest_change
                                    .as_ref()
                                    .map(Change::source_stamp)
                                    .unwrap_or_else(|| SourceStamp::branch_tip("", "")),
                            )
                        }
                        _ => None,
                    }
                });
                match stamp {
                    Some(stamp) => {
                        let (buildset, _) = self
                            .store
                            .add_buildset(
                                vec![stamp],
                                format!("periodic scheduler '{}'", self.config.name),
                                HashMap::new(),
                                &self.config.builder_names,
                                0,
                            )
                            .await?;
                        info!(
                            scheduler = %self.config.name,
                            buildset = %buildset,
                            "periodic buildset submitted"
                        );
                        Ok(vec![buildset])
                    }
                    None => Ok(Vec::new()),
                }
            }
            SchedulerKind::Triggerable | SchedulerKind::Force => Ok(Vec::new()),
        }
    }

    /// Submit the coalesced stabilization window as one buildset.
    async fn submit_pending(&self) -> Result<Option<BuildSetId>> {
        let (changes, stamp) = self.with_state(|state| {
            state.stable_deadline = None;
            let changes: Vec<Change> = state.pending_changes.drain(..).collect();
            let stamp = changes.last().map(Change::source_stamp);
            (changes, stamp)
        });
        let Some(stamp) = stamp else {
            return Ok(None);
        };
        let newest = changes.iter().map(|c| c.id).max();
        let reason = format!(
            "{} change(s) on {} via scheduler '{}'",
            changes.len(),
            stamp.branch,
            self.config.name
        );
        let (buildset, _) = self
            .store
            .add_buildset(
                vec![stamp],
                reason,
                HashMap::new(),
                &self.config.builder_names,
                0,
            )
            .await?;
        if let Some(newest) = newest {
            self.store.set_scheduler_last_change(self.name(), newest).await?;
            self.with_state(|state| state.last_change = Some(newest));
        }
        info!(
            scheduler = %self.config.name,
            buildset = %buildset,
            changes = changes.len(),
            "change-triggered buildset submitted"
        );
        Ok(Some(buildset))
    }

    /// Explicit invocation of a triggerable scheduler. Returns the buildset
    /// and, when `wait` is set, a receiver resolving to the aggregate
    /// outcome once the buildset completes.
    pub async fn trigger(
        &self,
        source_stamps: Vec<SourceStamp>,
        properties: HashMap<String, serde_json::Value>,
        wait: bool,
    ) -> Result<(BuildSetId, Option<oneshot::Receiver<BuildOutcome>>)> {
        if !matches!(self.config.kind, SchedulerKind::Triggerable) {
            return Err(Error::InvalidInput(format!(
                "scheduler '{}' is not triggerable",
                self.config.name
            )));
        }
        let (buildset, _) = self
            .store
            .add_buildset(
                source_stamps,
                format!("triggered via scheduler '{}'", self.config.name),
                properties,
                &self.config.builder_names,
                0,
            )
            .await?;
        let receiver = if wait {
            let (tx, rx) = oneshot::channel();
            self.with_state(|state| state.waiters.push((buildset, tx)));
            Some(rx)
        } else {
            None
        };
        Ok((buildset, receiver))
    }

    /// Explicit force operation on a manual scheduler.
    pub async fn force(
        &self,
        reason: String,
        properties: HashMap<String, serde_json::Value>,
    ) -> Result<BuildSetId> {
        if !matches!(self.config.kind, SchedulerKind::Force) {
            return Err(Error::InvalidInput(format!(
                "scheduler '{}' does not accept force requests",
                self.config.name
            )));
        }
        let (buildset, _) = self
            .store
            .add_buildset(
                vec![SourceStamp::branch_tip("", "")],
                reason,
                properties,
                &self.config.builder_names,
                0,
            )
            .await?;
        info!(scheduler = %self.config.name, buildset = %buildset, "forced buildset");
        Ok(buildset)
    }
}

fn lock(states: &StateMap) -> MutexGuard<'_, HashMap<String, RetainedState>> {
    match states.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
