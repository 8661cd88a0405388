//! Declarative configuration entities.
//!
//! A `MasterConfig` describes the desired state of the system: builders,
//! schedulers, locks, and workers. The reconfiguration controller diffs two
//! of these by name; entities are never mutated in place, a changed entity
//! is drained and replaced wholesale.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Builder names starting with this prefix are reserved for internal use.
pub const RESERVED_BUILDER_PREFIX: &str = "_";

/// Scope of a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockScope {
    /// One claim table shared across all workers.
    Global,
    /// An independent claim table per worker name.
    PerWorker,
}

/// How a claim counts against a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    /// Requires zero other holders; blocks all other claims while held.
    Exclusive,
    /// Shares the lock up to `max_count` concurrent counting holders.
    Counting,
}

/// A builder's (or step's) reference to a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockAccess {
    pub lock: String,
    pub mode: LockMode,
}

/// Definition of a lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    pub name: String,
    pub scope: LockScope,
    /// Capacity for counting claims; 1 makes the lock fully exclusive.
    pub max_count: u32,
}

/// Worker-selection policy for a builder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextWorkerPolicy {
    /// First idle worker in the configured order.
    #[default]
    InOrder,
    /// Idle worker with the fewest running builds.
    LeastLoaded,
}

/// Request-selection policy for a builder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NextBuildPolicy {
    /// Oldest submitted request first.
    #[default]
    Fifo,
    /// Highest priority first, submission order within a priority.
    Priority,
}

/// A named unit of work configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub name: String,
    /// Reference to the build factory (steps definition), resolved by the
    /// execution layer.
    pub factory: String,
    /// Workers eligible to run this builder, in preference order. Must be
    /// non-empty.
    pub worker_names: Vec<String>,
    /// Builder-level locks, acquired before a build starts.
    pub locks: Vec<LockAccess>,
    pub next_worker: NextWorkerPolicy,
    pub next_build: NextBuildPolicy,
    pub category: Option<String>,
}

/// What kind of scheduler, with its trigger-specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SchedulerKind {
    /// Fires on matching changes after a stabilization delay that coalesces
    /// rapid-fire changes into one buildset.
    SingleBranch {
        /// Only changes on this branch trigger; `None` accepts any branch.
        branch: Option<String>,
        /// Only changes in this category trigger; `None` accepts any.
        category: Option<String>,
        /// How long the branch must be quiet before submitting.
        stable_delay: Duration,
    },
    /// Fires on a wall-clock interval with the latest known source stamp.
    Periodic { interval: Duration },
    /// Inert until invoked by name; the invoker may block on completion.
    Triggerable,
    /// Only fires on an explicit external force operation.
    Force,
}

/// A reactive entity that decides when to submit buildsets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub name: String,
    /// Builders each submission fans out to.
    pub builder_names: Vec<String>,
    pub kind: SchedulerKind,
}

/// A worker the master will accept a handshake from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    /// Shared secret checked during the handshake (opaque to the core).
    pub password: String,
}

/// Timing knobs for leases, heartbeats, and assignment retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tuning {
    /// How often a master reasserts its claim leases.
    pub reclaim_interval: Duration,
    /// A claim older than `unclaimed_build_factor * reclaim_interval` is
    /// treated as abandoned by the reclaim sweep.
    pub unclaimed_build_factor: u32,
    /// An idle worker silent for longer than this is marked lost.
    pub heartbeat_timeout: Duration,
    /// Assignment attempts per request before it fails with an
    /// infrastructure outcome.
    pub start_build_retries: u32,
    /// How often scheduler `poll()` hooks run.
    pub poll_interval: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            reclaim_interval: Duration::from_secs(60),
            unclaimed_build_factor: 10,
            heartbeat_timeout: Duration::from_secs(300),
            start_build_retries: 3,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// The whole declarative configuration applied to a master.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub builders: Vec<BuilderConfig>,
    #[serde(default)]
    pub schedulers: Vec<SchedulerConfig>,
    #[serde(default)]
    pub locks: Vec<LockConfig>,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

impl MasterConfig {
    pub fn builder(&self, name: &str) -> Option<&BuilderConfig> {
        self.builders.iter().find(|b| b.name == name)
    }

    pub fn lock(&self, name: &str) -> Option<&LockConfig> {
        self.locks.iter().find(|l| l.name == name)
    }

    /// Empty property map for submissions with no requested properties.
    pub fn no_properties() -> HashMap<String, serde_json::Value> {
        HashMap::new()
    }
}
