//! Error types for the work-item store.

/// Errors that can occur in store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization / deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Work item not found
    #[error("work item not found: {0}")]
    ItemNotFound(String),

    /// Unknown work item kind in a stored row
    #[error("invalid work item kind: {0}")]
    InvalidKind(String),

    /// Unknown work item status in a stored row
    #[error("invalid work item status: {0}")]
    InvalidStatus(String),

    /// Unknown role in a stored row
    #[error("invalid role: {0}")]
    InvalidRole(String),

    /// Unknown history action in a stored row
    #[error("invalid history action: {0}")]
    InvalidAction(String),

    /// Operation applied to the wrong kind of item
    #[error("expected {expected} item, got {actual}: {id}")]
    KindMismatch {
        /// Kind the operation requires
        expected: crate::types::WorkItemKind,
        /// Kind the item actually has
        actual: crate::types::WorkItemKind,
        /// Item ID
        id: String,
    },

    /// Status transition not allowed by the work-item state machine
    #[error("illegal transition {from} -> {to} for {id}")]
    InvalidTransition {
        /// Current status
        from: crate::types::WorkItemStatus,
        /// Requested status
        to: crate::types::WorkItemStatus,
        /// Item ID
        id: String,
    },

    /// General internal error
    #[error("{0}")]
    Internal(String),
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, StoreError>;
