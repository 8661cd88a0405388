//! The worker transport boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{BuildOutcome, BuildRequestId, BuildSetId, Result, SourceStamp};

/// Everything a worker needs to start one build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    pub request: BuildRequestId,
    pub buildset: BuildSetId,
    pub builder_name: String,
    /// Factory reference resolved by the execution layer on the worker.
    pub factory: String,
    pub source_stamps: Vec<SourceStamp>,
    pub properties: HashMap<String, serde_json::Value>,
}

/// Events the transport delivers to the master.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Handshake completed: the worker is attached and advertising.
    Connected {
        name: String,
        capabilities: Vec<String>,
        max_builds: usize,
    },
    /// Liveness ping.
    Heartbeat { name: String },
    /// Connection dropped; any running builds on it are orphaned.
    Disconnected { name: String },
    /// A build finished on the worker, successfully or not.
    BuildComplete {
        worker: String,
        request: BuildRequestId,
        outcome: BuildOutcome,
    },
}

/// Commands the master sends to workers.
///
/// Both calls are round-trips: an `Err` means the worker did not acknowledge
/// (nack, timeout, or disconnect) and the caller recovers by releasing the
/// claim and retrying elsewhere.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    async fn send_start_build(&self, worker: &str, spec: BuildSpec) -> Result<()>;

    /// Deliver a cooperative cancellation signal. The worker is expected to
    /// terminate the running step and report an aborted result through the
    /// normal `BuildComplete` path.
    async fn send_cancel_build(&self, worker: &str, request: BuildRequestId) -> Result<()>;
}
