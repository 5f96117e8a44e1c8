//! Daedalus Store - SQLite persistence for the work-item hierarchy.
//!
//! Holds the shared state every dispatcher and role agent coordinates
//! through: work items (epics, stories, tasks, bugs), their append-only
//! history, bug investigation metadata, and the item-level locks that
//! make concurrent agents safe against double-processing.
//!
//! Locking is store-level: `claim` is a single conditional UPDATE, so
//! the compare-and-set resolves inside SQLite rather than in process
//! memory, and any number of orchestrator processes can share one
//! database file.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::WorkStore;
pub use types::{
    BugMetadata, ErrorKind, ErrorRecord, HistoryAction, RoleKind, WorkHistory, WorkItem,
    WorkItemKind, WorkItemStatus,
};
