//! Buildsets, build requests, and result aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{BuildRequestId, BuildSetId, MasterId, SourceStamp};

/// Final outcome of a build, a build request, or an aggregated buildset.
///
/// Ordered by severity: aggregation across a buildset is worst-case-wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BuildOutcome {
    Success,
    Warnings,
    Skipped,
    Failure,
    /// Infrastructure failure (lost worker, exhausted assignment retries),
    /// distinct from a build-logic failure.
    Exception,
    Retry,
    Cancelled,
}

impl BuildOutcome {
    /// Worst-case-wins aggregation.
    pub fn worst(self, other: BuildOutcome) -> BuildOutcome {
        self.max(other)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Success | BuildOutcome::Warnings)
    }
}

/// One logical trigger event, fanning out to one build request per target
/// builder.
///
/// Identity is immutable; only the completion result mutates, and exactly
/// once, when the last child request completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSet {
    pub id: BuildSetId,
    /// What to build, one stamp per codebase.
    pub source_stamps: Vec<SourceStamp>,
    /// Human-readable reason ("force build", "changes on main", ...).
    pub reason: String,
    /// Properties requested by the submitter, forwarded to every build.
    pub properties: HashMap<String, serde_json::Value>,
    pub submitted_at: DateTime<Utc>,
    /// Aggregate result once all child requests complete.
    pub result: Option<BuildOutcome>,
}

impl BuildSet {
    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}

/// One unit of schedulable work: a (buildset, builder) pair.
///
/// Lifecycle: `unclaimed → claimed → complete`. A claim is a lease held by
/// one master identity; it must be periodically reasserted, and an expired
/// claim is returned to unclaimed by the reclaim sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub id: BuildRequestId,
    pub buildset_id: BuildSetId,
    pub builder_name: String,
    /// Higher runs first under the `Priority` next-build policy.
    pub priority: i32,
    pub submitted_at: DateTime<Utc>,
    /// Master currently holding the claim lease, if any.
    pub claimed_by: Option<MasterId>,
    /// Worker the claim was assigned to, once assignment succeeds.
    pub assigned_worker: Option<String>,
    /// When the lease was taken or last reasserted.
    pub claimed_at: Option<DateTime<Utc>>,
    pub result: Option<BuildOutcome>,
}

impl BuildRequest {
    pub fn is_claimed(&self) -> bool {
        self.claimed_by.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worst_case_aggregation() {
        assert_eq!(
            BuildOutcome::Success.worst(BuildOutcome::Failure),
            BuildOutcome::Failure
        );
        assert_eq!(
            BuildOutcome::Failure.worst(BuildOutcome::Exception),
            BuildOutcome::Exception
        );
        assert_eq!(
            BuildOutcome::Warnings.worst(BuildOutcome::Success),
            BuildOutcome::Warnings
        );
    }

    #[test]
    fn test_success_includes_warnings() {
        assert!(BuildOutcome::Warnings.is_success());
        assert!(!BuildOutcome::Skipped.is_success());
    }
}
