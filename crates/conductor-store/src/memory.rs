//! Mutex-guarded in-memory store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use conductor_core::store::Store;
use conductor_core::{
    BuildOutcome, BuildRequest, BuildRequestId, BuildSet, BuildSetId, Change, ChangeId, Error,
    MasterId, Result, SourceStamp,
};

#[derive(Default)]
struct Inner {
    changes: BTreeMap<ChangeId, Change>,
    next_change: u64,
    buildsets: HashMap<BuildSetId, BuildSet>,
    /// Child request ids per buildset, in fan-out order.
    children: HashMap<BuildSetId, Vec<BuildRequestId>>,
    /// BTreeMap keeps requests in id order, which is submission order.
    requests: BTreeMap<BuildRequestId, BuildRequest>,
    next_buildset: u64,
    next_request: u64,
    scheduler_state: HashMap<String, ChangeId>,
}

/// In-memory [`Store`].
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Internal("store mutex poisoned".to_string()))
    }

    /// Complete the owning buildset if every child request now has a result.
    fn maybe_complete_buildset(
        inner: &mut Inner,
        buildset_id: BuildSetId,
    ) -> Option<(BuildSetId, BuildOutcome)> {
        let children = inner.children.get(&buildset_id)?;
        let mut aggregate = BuildOutcome::Success;
        for child in children {
            match inner.requests.get(child).and_then(|r| r.result) {
                Some(outcome) => aggregate = aggregate.worst(outcome),
                None => return None,
            }
        }
        let buildset = inner.buildsets.get_mut(&buildset_id)?;
        if buildset.result.is_some() {
            return None;
        }
        buildset.result = Some(aggregate);
        debug!(buildset = %buildset_id, outcome = ?aggregate, "buildset complete");
        Some((buildset_id, aggregate))
    }
}

#[async_trait]
impl Store for MemStore {
    async fn add_change(&self, mut change: Change) -> Result<ChangeId> {
        let mut inner = self.lock()?;
        inner.next_change += 1;
        let id = ChangeId(inner.next_change);
        change.id = id;
        inner.changes.insert(id, change);
        Ok(id)
    }

    async fn changes_since(&self, since: ChangeId) -> Result<Vec<Change>> {
        let inner = self.lock()?;
        Ok(inner
            .changes
            .range((Bound::Excluded(since), Bound::Unbounded))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn add_buildset(
        &self,
        source_stamps: Vec<SourceStamp>,
        reason: String,
        properties: HashMap<String, serde_json::Value>,
        builder_names: &[String],
        priority: i32,
    ) -> Result<(BuildSetId, Vec<BuildRequestId>)> {
        if builder_names.is_empty() {
            return Err(Error::InvalidInput(
                "buildset must target at least one builder".to_string(),
            ));
        }
        let mut inner = self.lock()?;
        inner.next_buildset += 1;
        let buildset_id = BuildSetId(inner.next_buildset);
        let now = Utc::now();
        inner.buildsets.insert(
            buildset_id,
            BuildSet {
                id: buildset_id,
                source_stamps,
                reason,
                properties,
                submitted_at: now,
                result: None,
            },
        );
        let mut request_ids = Vec::with_capacity(builder_names.len());
        for builder_name in builder_names {
            inner.next_request += 1;
            let id = BuildRequestId(inner.next_request);
            inner.requests.insert(
                id,
                BuildRequest {
                    id,
                    buildset_id,
                    builder_name: builder_name.clone(),
                    priority,
                    submitted_at: now,
                    claimed_by: None,
                    assigned_worker: None,
                    claimed_at: None,
                    result: None,
                },
            );
            request_ids.push(id);
        }
        inner.children.insert(buildset_id, request_ids.clone());
        Ok((buildset_id, request_ids))
    }

    async fn unclaimed_build_requests(&self, builder_name: &str) -> Result<Vec<BuildRequest>> {
        let inner = self.lock()?;
        Ok(inner
            .requests
            .values()
            .filter(|r| {
                r.builder_name == builder_name && r.claimed_by.is_none() && r.result.is_none()
            })
            .cloned()
            .collect())
    }

    async fn claim_build_request(&self, id: BuildRequestId, master: MasterId) -> Result<bool> {
        let mut inner = self.lock()?;
        let Some(request) = inner.requests.get_mut(&id) else {
            return Ok(false);
        };
        if request.claimed_by.is_some() || request.result.is_some() {
            return Ok(false);
        }
        request.claimed_by = Some(master);
        request.claimed_at = Some(Utc::now());
        Ok(true)
    }

    async fn set_assigned_worker(&self, id: BuildRequestId, worker: &str) -> Result<()> {
        let mut inner = self.lock()?;
        let request = inner
            .requests
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("build request {id}")))?;
        request.assigned_worker = Some(worker.to_string());
        Ok(())
    }

    async fn reassert_claims(&self, master: MasterId, ids: &[BuildRequestId]) -> Result<()> {
        let mut inner = self.lock()?;
        let now = Utc::now();
        for id in ids {
            if let Some(request) = inner.requests.get_mut(id) {
                if request.claimed_by == Some(master) {
                    request.claimed_at = Some(now);
                }
            }
        }
        Ok(())
    }

    async fn unclaim_build_request(&self, id: BuildRequestId) -> Result<()> {
        let mut inner = self.lock()?;
        if let Some(request) = inner.requests.get_mut(&id) {
            if request.result.is_none() {
                request.claimed_by = None;
                request.claimed_at = None;
                request.assigned_worker = None;
            }
        }
        Ok(())
    }

    async fn reclaim_expired_claims(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.lock()?;
        let mut reclaimed = 0;
        for request in inner.requests.values_mut() {
            if request.result.is_some() {
                continue;
            }
            let expired = matches!(request.claimed_at, Some(at) if at < cutoff);
            if request.claimed_by.is_some() && expired {
                debug!(request = %request.id, "reclaiming expired claim");
                request.claimed_by = None;
                request.claimed_at = None;
                request.assigned_worker = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn record_build_result(
        &self,
        id: BuildRequestId,
        outcome: BuildOutcome,
    ) -> Result<Option<(BuildSetId, BuildOutcome)>> {
        let mut inner = self.lock()?;
        let Some(request) = inner.requests.get_mut(&id) else {
            return Err(Error::NotFound(format!("build request {id}")));
        };
        // Tolerate duplicate completion reports from recovery paths.
        if request.result.is_some() {
            return Ok(None);
        }
        request.result = Some(outcome);
        let buildset_id = request.buildset_id;
        Ok(Self::maybe_complete_buildset(&mut inner, buildset_id))
    }

    async fn cancel_build_request(
        &self,
        id: BuildRequestId,
    ) -> Result<(bool, Option<(BuildSetId, BuildOutcome)>)> {
        let mut inner = self.lock()?;
        let Some(request) = inner.requests.get_mut(&id) else {
            return Ok((false, None));
        };
        if request.claimed_by.is_some() || request.result.is_some() {
            return Ok((false, None));
        }
        request.result = Some(BuildOutcome::Cancelled);
        let buildset_id = request.buildset_id;
        Ok((true, Self::maybe_complete_buildset(&mut inner, buildset_id)))
    }

    async fn get_build_request(&self, id: BuildRequestId) -> Result<BuildRequest> {
        let inner = self.lock()?;
        inner
            .requests
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("build request {id}")))
    }

    async fn get_buildset(&self, id: BuildSetId) -> Result<BuildSet> {
        let inner = self.lock()?;
        inner
            .buildsets
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("buildset {id}")))
    }

    async fn scheduler_last_change(&self, scheduler_name: &str) -> Result<Option<ChangeId>> {
        let inner = self.lock()?;
        Ok(inner.scheduler_state.get(scheduler_name).copied())
    }

    async fn set_scheduler_last_change(
        &self,
        scheduler_name: &str,
        change: ChangeId,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        inner
            .scheduler_state
            .insert(scheduler_name.to_string(), change);
        Ok(())
    }
}
