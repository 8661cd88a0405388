//! Configuration diffing for live reconfiguration.
//!
//! Entities are diffed by name. An entity present in both configurations
//! but with any field changed is treated as remove-old + add-new; nothing
//! is ever mutated in place, which keeps partial-update races out of the
//! picture entirely.

use conductor_core::config::MasterConfig;

/// How one named entity set changed between two configurations.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NamedDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub replaced: Vec<String>,
    pub unchanged: Vec<String>,
}

impl NamedDiff {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.replaced.is_empty()
    }
}

/// Full diff between two master configurations.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ConfigDiff {
    pub builders: NamedDiff,
    pub schedulers: NamedDiff,
    pub locks: NamedDiff,
    pub workers: NamedDiff,
}

impl ConfigDiff {
    pub fn is_noop(&self) -> bool {
        self.builders.is_noop()
            && self.schedulers.is_noop()
            && self.locks.is_noop()
            && self.workers.is_noop()
    }
}

/// What a completed reconfiguration did, so callers (and tests) can observe
/// idempotence: an identical configuration yields all-zero counts.
#[derive(Debug, Default, Clone)]
pub struct ReconfigOutcome {
    pub added: usize,
    pub removed: usize,
    pub replaced: usize,
    pub unchanged: usize,
    /// Apply-phase problems. A non-empty list means the system is running
    /// partially reconfigured.
    pub warnings: Vec<String>,
}

impl ReconfigOutcome {
    pub fn from_diff(diff: &ConfigDiff) -> Self {
        let sets = [&diff.builders, &diff.schedulers, &diff.locks, &diff.workers];
        Self {
            added: sets.iter().map(|d| d.added.len()).sum(),
            removed: sets.iter().map(|d| d.removed.len()).sum(),
            replaced: sets.iter().map(|d| d.replaced.len()).sum(),
            unchanged: sets.iter().map(|d| d.unchanged.len()).sum(),
            warnings: Vec::new(),
        }
    }
}

/// Diff two configurations entity-set by entity-set.
pub fn diff(old: &MasterConfig, new: &MasterConfig) -> ConfigDiff {
    ConfigDiff {
        builders: diff_named(&old.builders, &new.builders, |b| &b.name),
        schedulers: diff_named(&old.schedulers, &new.schedulers, |s| &s.name),
        locks: diff_named(&old.locks, &new.locks, |l| &l.name),
        workers: diff_named(&old.workers, &new.workers, |w| &w.name),
    }
}

fn diff_named<T: PartialEq>(old: &[T], new: &[T], name: impl Fn(&T) -> &str) -> NamedDiff {
    let mut result = NamedDiff::default();

    for entity in new {
        match old.iter().find(|o| name(o) == name(entity)) {
            None => result.added.push(name(entity).to_string()),
            Some(previous) if previous != entity => {
                result.replaced.push(name(entity).to_string());
            }
            Some(_) => result.unchanged.push(name(entity).to_string()),
        }
    }
    for entity in old {
        if !new.iter().any(|n| name(n) == name(entity)) {
            result.removed.push(name(entity).to_string());
        }
    }
    result
}
