//! Core orchestration engine for Daedalus.
//!
//! This crate hosts the dispatch loop that walks the work-item hierarchy,
//! the role agents (architect, developer, reviewer, bug buster) that act on
//! claimed items, and the resilience machinery around them: keyed backoff,
//! response extraction, chaos injection, and self-healing bug synthesis.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod chaos;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod extract;
pub mod roles;
pub mod selfheal;

pub use backoff::{BackoffConfig, BackoffCoordinator, BackoffError, BackoffStatus};
pub use chaos::{ChaosConfig, CorruptionKind, ErrorInjector};
pub use config::OrchestratorConfig;
pub use dispatch::{CycleReport, Decision, DecisionAction, Dispatcher, DispatcherBuilder};
pub use error::{EngineError, Result};
pub use extract::{extract_as, extract_json, ExtractError};
pub use roles::{
    ArchitectAgent, BugBusterAgent, DeveloperAgent, ReviewerAgent, RoleAgent, RoleOutcome,
    RoleRunner,
};
pub use selfheal::SelfHealer;
