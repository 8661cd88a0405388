//! The persistent store boundary.
//!
//! The one correctness-critical primitive in the whole system is
//! [`Store::claim_build_request`]: an atomic compare-and-set that must admit
//! exactly one winner across concurrent callers, including callers in other
//! master processes sharing the store. Everything else is bookkeeping.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::{
    BuildOutcome, BuildRequest, BuildRequestId, BuildSet, BuildSetId, Change, ChangeId, MasterId,
    Result, SourceStamp,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Record a new change, assigning the next monotonic id.
    async fn add_change(&self, change: Change) -> Result<ChangeId>;

    /// Changes with an id strictly greater than `since`, in id order.
    async fn changes_since(&self, since: ChangeId) -> Result<Vec<Change>>;

    /// Create a buildset and fan it out to one build request per builder.
    async fn add_buildset(
        &self,
        source_stamps: Vec<SourceStamp>,
        reason: String,
        properties: HashMap<String, serde_json::Value>,
        builder_names: &[String],
        priority: i32,
    ) -> Result<(BuildSetId, Vec<BuildRequestId>)>;

    /// Unclaimed, incomplete requests for one builder, in submission order.
    async fn unclaimed_build_requests(&self, builder_name: &str) -> Result<Vec<BuildRequest>>;

    /// Atomically claim a request for `master`; `false` if already claimed,
    /// complete, or unknown. Exactly one of any set of concurrent callers
    /// wins.
    async fn claim_build_request(&self, id: BuildRequestId, master: MasterId) -> Result<bool>;

    /// Record which worker a claimed request was assigned to.
    async fn set_assigned_worker(&self, id: BuildRequestId, worker: &str) -> Result<()>;

    /// Reassert the lease on claims held by `master`.
    async fn reassert_claims(&self, master: MasterId, ids: &[BuildRequestId]) -> Result<()>;

    /// Release a claim, returning the request to unclaimed. Idempotent.
    async fn unclaim_build_request(&self, id: BuildRequestId) -> Result<()>;

    /// Return every claim last asserted before `cutoff` to unclaimed,
    /// regardless of owner. Returns how many were reclaimed.
    async fn reclaim_expired_claims(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Complete a request. Returns the owning buildset's id and aggregate
    /// outcome if this completion finished the buildset.
    async fn record_build_result(
        &self,
        id: BuildRequestId,
        outcome: BuildOutcome,
    ) -> Result<Option<(BuildSetId, BuildOutcome)>>;

    /// Withdraw an unclaimed request; `false` if it was already claimed or
    /// complete. May complete the owning buildset, reported the same way as
    /// `record_build_result`.
    async fn cancel_build_request(
        &self,
        id: BuildRequestId,
    ) -> Result<(bool, Option<(BuildSetId, BuildOutcome)>)>;

    async fn get_build_request(&self, id: BuildRequestId) -> Result<BuildRequest>;

    async fn get_buildset(&self, id: BuildSetId) -> Result<BuildSet>;

    /// Last change id a scheduler has fully processed, if recorded.
    async fn scheduler_last_change(&self, scheduler_name: &str) -> Result<Option<ChangeId>>;

    async fn set_scheduler_last_change(
        &self,
        scheduler_name: &str,
        change: ChangeId,
    ) -> Result<()>;
}
