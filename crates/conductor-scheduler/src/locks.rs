//! The lock registry: single source of truth for lock claim state.
//!
//! `try_acquire` is non-blocking; callers retry on a later relevant event
//! (a release triggers a distributor tick) rather than busy-polling.
//! `release` is idempotent and a safe no-op for holders that never held the
//! lock, because failure-recovery paths release speculatively.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use conductor_core::config::{LockConfig, LockMode, LockScope};

/// Key for the global scope table. Per-worker locks key by worker name.
const GLOBAL_SCOPE: &str = "";

#[derive(Debug, Clone)]
struct Claim {
    holder: String,
    mode: LockMode,
}

#[derive(Debug)]
struct LockEntry {
    scope: LockScope,
    max_count: u32,
    /// Claims keyed by scope: worker name for per-worker locks, one shared
    /// key for global locks.
    claims: HashMap<String, Vec<Claim>>,
    /// Cleared when the lock disappears from config; existing claims drain
    /// but no new claim is granted.
    active: bool,
}

impl LockEntry {
    fn total_claims(&self) -> usize {
        self.claims.values().map(Vec::len).sum()
    }
}

/// Tracks every lock's current claim state.
#[derive(Default)]
pub struct LockRegistry {
    inner: Mutex<HashMap<String, LockEntry>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        // Claim state is never left inconsistent mid-panic: every mutation
        // is a single insert or remove.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Apply a lock configuration.
    ///
    /// Existing holders are never evicted; a shrink of `max_count` below the
    /// current holder count is tolerated and drains naturally, with a
    /// warning so operators can see the over-subscription.
    pub fn configure(&self, locks: &[LockConfig]) {
        let mut table = self.lock_table();

        for entry in table.values_mut() {
            entry.active = false;
        }

        for config in locks {
            match table.get_mut(&config.name) {
                Some(entry) => {
                    entry.active = true;
                    entry.scope = config.scope;
                    if config.max_count < entry.max_count
                        && entry.total_claims() > config.max_count as usize
                    {
                        warn!(
                            lock = %config.name,
                            holders = entry.total_claims(),
                            max_count = config.max_count,
                            "lock shrunk below current holders; over-subscription will drain"
                        );
                    }
                    entry.max_count = config.max_count;
                }
                None => {
                    table.insert(
                        config.name.clone(),
                        LockEntry {
                            scope: config.scope,
                            max_count: config.max_count,
                            claims: HashMap::new(),
                            active: true,
                        },
                    );
                }
            }
        }

        // Removed locks with no holders disappear; held ones stay to drain.
        table.retain(|_, entry| entry.active || entry.total_claims() > 0);
    }

    /// Try to claim `lock` for `holder`. Non-blocking; `false` means the
    /// grant would violate the lock's invariant right now.
    pub fn try_acquire(&self, lock: &str, worker: &str, mode: LockMode, holder: &str) -> bool {
        let mut table = self.lock_table();
        let Some(entry) = table.get_mut(lock) else {
            warn!(lock, holder, "acquisition of unknown lock denied");
            return false;
        };
        if !entry.active {
            return false;
        }

        let key = match entry.scope {
            LockScope::Global => GLOBAL_SCOPE,
            LockScope::PerWorker => worker,
        };
        let claims = entry.claims.entry(key.to_string()).or_default();

        if claims.iter().any(|c| c.mode == LockMode::Exclusive) {
            return false;
        }
        let granted = match mode {
            LockMode::Exclusive => claims.is_empty(),
            LockMode::Counting => claims.len() < entry.max_count as usize,
        };
        if granted {
            debug!(lock, worker, holder, ?mode, "lock acquired");
            claims.push(Claim {
                holder: holder.to_string(),
                mode,
            });
        }
        granted
    }

    /// Release `holder`'s claim if it has one. Idempotent.
    pub fn release(&self, lock: &str, worker: &str, holder: &str) {
        let mut table = self.lock_table();
        let Some(entry) = table.get_mut(lock) else {
            return;
        };
        let key = match entry.scope {
            LockScope::Global => GLOBAL_SCOPE,
            LockScope::PerWorker => worker,
        };
        if let Some(claims) = entry.claims.get_mut(key) {
            let before = claims.len();
            claims.retain(|c| c.holder != holder);
            if claims.len() != before {
                debug!(lock, worker, holder, "lock released");
            }
        }
        if !entry.active && entry.total_claims() == 0 {
            table.remove(lock);
        }
    }

    /// Current holder count for one scope of a lock.
    pub fn holder_count(&self, lock: &str, worker: &str) -> usize {
        let table = self.lock_table();
        let Some(entry) = table.get(lock) else {
            return 0;
        };
        let key = match entry.scope {
            LockScope::Global => GLOBAL_SCOPE,
            LockScope::PerWorker => worker,
        };
        entry.claims.get(key).map_or(0, Vec::len)
    }
}
