//! Error types for the orchestration engine.

use daedalus_exec::ExecError;
use daedalus_store::StoreError;

use crate::extract::ExtractError;

/// Errors surfaced by the dispatch loop and role agents.
///
/// Agent-level failures (a CLI that exits non-zero, output that does not
/// parse) are recorded as work-item history and do not appear here; this
/// enum covers faults the engine itself cannot absorb, such as a failing
/// store or an invalid configuration.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Persistence layer failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Agent executor failure that escaped the retry envelope.
    #[error("executor error: {0}")]
    Exec(#[from] ExecError),

    /// Response extraction failure.
    #[error("extraction error: {0}")]
    Extract(#[from] ExtractError),

    /// JSON (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration rejected during validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Convenience result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
