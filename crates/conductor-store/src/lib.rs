//! In-memory implementation of the Conductor store boundary.
//!
//! Backs single-process deployments and every test in the workspace. The
//! claim table lives behind one mutex, which makes the claim compare-and-set
//! trivially atomic; a database-backed store would supply the same guarantee
//! with a conditional UPDATE.

pub mod memory;

pub use memory::MemStore;
