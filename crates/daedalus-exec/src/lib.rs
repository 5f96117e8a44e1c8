//! Daedalus Exec - external agent process execution.
//!
//! The orchestrator never reasons itself; it hands a role-specific
//! prompt to an external agent CLI and gets raw text back. This crate
//! owns that boundary: one process per invocation, a hard timeout, an
//! output-size ceiling, and every failure surfaced as an `Err` value
//! rather than a panic.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod executor;

pub use error::{ExecError, ExecResult};
pub use executor::{AgentExecutor, ExecutorConfig, ShellExecutor};
