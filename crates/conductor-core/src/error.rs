//! Error types for Conductor.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    #[error("worker transport failed: {0}")]
    Transport(String),

    #[error("configuration rejected: {0:?}")]
    ConfigRejected(Vec<String>),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
