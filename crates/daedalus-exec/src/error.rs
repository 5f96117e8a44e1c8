//! Error types for agent execution.

/// Errors that can occur while running an external agent process.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The process could not be spawned or exited non-zero
    #[error("agent execution failed: {0}")]
    ExecutionFailed(String),

    /// The process ran past its deadline and was killed
    #[error("agent execution timed out after {0}s")]
    Timeout(u64),

    /// The process produced more output than the configured ceiling
    #[error("agent output too large: {size} bytes (limit {limit_mb} MB)")]
    OutputTooLarge {
        /// Bytes the process actually produced
        size: usize,
        /// Configured ceiling in megabytes
        limit_mb: u64,
    },
}

/// Convenience Result type.
pub type ExecResult<T> = std::result::Result<T, ExecError>;
