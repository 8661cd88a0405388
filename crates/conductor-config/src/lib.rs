//! Declarative configuration for the Conductor build master.
//!
//! Parses the KDL master configuration into [`conductor_core::MasterConfig`]
//! and validates the whole structure before anything is applied. Validation
//! reports every problem it finds, not just the first, so an operator can
//! fix a config in one pass.

pub mod error;
pub mod master;
pub mod validate;

pub use error::{ConfigError, ConfigResult};
pub use master::parse_master_config;
pub use validate::validate;
