//! Orchestrator-level configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Tuning knobs for the dispatch loop.
///
/// All durations are carried as primitive milliseconds so the struct stays
/// trivially serializable; accessor methods convert to [`Duration`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Delay between dispatch cycles in milliseconds.
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,

    /// Maximum number of work items processed concurrently per cycle.
    #[serde(default = "default_max_concurrent_managers")]
    pub max_concurrent_managers: usize,

    /// Ceiling on simultaneously active developer agents.
    #[serde(default = "default_max_concurrent_developers")]
    pub max_concurrent_developers: u32,

    /// Age in milliseconds after which a processing lock is considered stale.
    #[serde(default = "default_stale_lock_timeout_ms")]
    pub stale_lock_timeout_ms: u64,

    /// Number of recent history entries rendered into agent prompts.
    #[serde(default = "default_history_window")]
    pub history_window: u32,

    /// How far back the self-healing sweep looks for unconverted errors, in hours.
    #[serde(default = "default_error_lookback_hours")]
    pub error_lookback_hours: i64,

    /// Interval in milliseconds at which a running role agent refreshes its lock.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
}

fn default_polling_interval_ms() -> u64 {
    5_000
}

fn default_max_concurrent_managers() -> usize {
    3
}

fn default_max_concurrent_developers() -> u32 {
    2
}

fn default_stale_lock_timeout_ms() -> u64 {
    600_000
}

fn default_history_window() -> u32 {
    20
}

fn default_error_lookback_hours() -> i64 {
    24
}

fn default_heartbeat_interval_ms() -> u64 {
    60_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: default_polling_interval_ms(),
            max_concurrent_managers: default_max_concurrent_managers(),
            max_concurrent_developers: default_max_concurrent_developers(),
            stale_lock_timeout_ms: default_stale_lock_timeout_ms(),
            history_window: default_history_window(),
            error_lookback_hours: default_error_lookback_hours(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// Delay between dispatch cycles.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Stale-lock threshold.
    pub fn stale_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.stale_lock_timeout_ms)
    }

    /// Lock refresh interval for long-running role agents.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Reject configurations the loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.polling_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "polling_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_managers == 0 {
            return Err(EngineError::InvalidConfig(
                "max_concurrent_managers must be greater than zero".to_string(),
            ));
        }
        if self.stale_lock_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "stale_lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "heartbeat_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.stale_lock_timeout_ms {
            return Err(EngineError::InvalidConfig(format!(
                "heartbeat_interval_ms ({}) must be shorter than stale_lock_timeout_ms ({})",
                self.heartbeat_interval_ms, self.stale_lock_timeout_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.polling_interval(), Duration::from_millis(5_000));
        assert_eq!(config.max_concurrent_developers, 2);
    }

    #[test]
    fn rejects_zero_polling_interval() {
        let config = OrchestratorConfig {
            polling_interval_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_heartbeat_longer_than_stale_timeout() {
        let config = OrchestratorConfig {
            heartbeat_interval_ms: 700_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn deserializes_partial_config() {
        let config: OrchestratorConfig =
            serde_json::from_str(r#"{"polling_interval_ms": 250}"#).expect("parse");
        assert_eq!(config.polling_interval_ms, 250);
        assert_eq!(config.history_window, default_history_window());
    }
}
