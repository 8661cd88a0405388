//! Core domain types and boundary traits for the Conductor build master.
//!
//! This crate contains:
//! - Identifiers for changes, buildsets, build requests, and masters
//! - Change and source stamp types
//! - BuildSet / BuildRequest records and result aggregation
//! - Declarative configuration entities (builders, schedulers, locks, workers)
//! - The `Store` trait (persistent claim table) and `WorkerTransport` trait

pub mod build;
pub mod change;
pub mod config;
pub mod error;
pub mod id;
pub mod store;
pub mod transport;
pub mod worker;

pub use build::{BuildOutcome, BuildRequest, BuildSet};
pub use change::{Change, SourceStamp};
pub use config::{
    BuilderConfig, LockAccess, LockConfig, LockMode, LockScope, MasterConfig, NextBuildPolicy,
    NextWorkerPolicy, SchedulerConfig, SchedulerKind, Tuning, WorkerConfig,
};
pub use error::{Error, Result};
pub use id::{BuildRequestId, BuildSetId, ChangeId, MasterId};
pub use store::Store;
pub use transport::{BuildSpec, WorkerEvent, WorkerTransport};
pub use worker::{WorkerHealth, WorkerState};
