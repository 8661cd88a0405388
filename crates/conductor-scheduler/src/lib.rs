//! The Conductor scheduling core.
//!
//! Matches pending build requests to idle, eligible, lock-available workers:
//! - [`locks::LockRegistry`] — exclusive/counting locks, global or per-worker
//! - [`pool::WorkerPool`] — attached workers, health, and capacity
//! - [`distributor::Distributor`] — the request/worker matching engine
//! - [`schedulers`] — change-triggered, periodic, triggerable, and force
//!   schedulers that submit new buildsets
//! - [`reconfig`] — configuration diffing for live reconfiguration
//! - [`master::BuildMaster`] — the assembled master with its control surface

pub mod distributor;
pub mod locks;
pub mod master;
pub mod pool;
pub mod reconfig;
pub mod schedulers;

pub use distributor::Distributor;
pub use locks::LockRegistry;
pub use master::{BuildMaster, BuilderStatus};
pub use pool::WorkerPool;
pub use reconfig::ReconfigOutcome;
