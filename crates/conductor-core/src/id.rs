//! Identifiers.
//!
//! Changes, buildsets, and build requests carry monotonically increasing
//! integer ids assigned by the store. Masters are identified by a UUID
//! minted at process start; the claim table records which master holds
//! each lease.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Monotonic identifier of a version-control change.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct ChangeId(pub u64);

/// Identifier of a buildset (one trigger event's fan-out).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct BuildSetId(pub u64);

/// Identifier of a single schedulable build request.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
pub struct BuildRequestId(pub u64);

/// Identity of one master process incarnation, used for claim leases.
///
/// A restarted master gets a fresh identity; claims held by the previous
/// incarnation expire and are returned to the pool by the reclaim sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct MasterId(Uuid);

impl MasterId {
    /// Mint a fresh master identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MasterId {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_ids_are_unique() {
        assert_ne!(MasterId::new(), MasterId::new());
    }

    #[test]
    fn test_request_id_ordering() {
        assert!(BuildRequestId(1) < BuildRequestId(2));
    }
}
