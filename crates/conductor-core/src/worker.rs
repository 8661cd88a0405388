//! Worker liveness and capability types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::BuildRequestId;

/// Health state of an attached worker.
///
/// The full connection lifecycle is `disconnected → handshaking → idle ⇄
/// busy → disconnected`; the disconnected and handshaking phases live at
/// the transport boundary, so the pool only ever sees a worker once its
/// handshake completed and it entered as idle. `idle → lost` happens after
/// a missed-heartbeat timeout, and only a fresh handshake returns a lost
/// worker to idle. A worker is busy exactly while its running-build count
/// is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerHealth {
    Idle,
    Busy,
    Lost,
}

/// Live state of one attached worker connection.
///
/// Session-scoped: rebuilt from the handshake on every connection. Only the
/// stable `name` key outlives the session, so claims can be reconciled after
/// a crash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub name: String,
    /// Builder names this worker advertises it can serve.
    pub capabilities: HashSet<String>,
    /// Maximum concurrent builds.
    pub max_builds: usize,
    /// Requests currently running on this worker.
    pub running: HashSet<BuildRequestId>,
    pub health: WorkerHealth,
    pub last_seen: DateTime<Utc>,
}

impl WorkerState {
    /// Whether the worker can take one more build.
    pub fn has_capacity(&self) -> bool {
        self.running.len() < self.max_builds
    }

    /// Load used by the least-loaded selection policy.
    pub fn load(&self) -> usize {
        self.running.len()
    }
}
