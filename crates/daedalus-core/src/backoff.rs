//! Keyed exponential backoff for transient agent failures.
//!
//! The coordinator tracks retry state per string key (typically
//! `"{role}:{work_item_id}"`), so one flaky item never inflates the delay
//! applied to its neighbours. Delays grow geometrically, are capped, and
//! carry symmetric jitter floored at zero.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Retry and delay parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Retries attempted after the initial call. Total attempts are
    /// `max_retries + 1`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound on any single delay in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Geometric growth factor between consecutive delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Half-width of the uniform jitter band in milliseconds.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_ms() -> u64 {
    500
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

impl BackoffConfig {
    /// Set the retry count.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the first-retry delay.
    #[must_use]
    pub fn with_initial_delay_ms(mut self, ms: u64) -> Self {
        self.initial_delay_ms = ms;
        self
    }

    /// Set the delay ceiling.
    #[must_use]
    pub fn with_max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = ms;
        self
    }

    /// Set the jitter half-width.
    #[must_use]
    pub fn with_jitter_ms(mut self, ms: u64) -> Self {
        self.jitter_ms = ms;
        self
    }
}

/// Terminal failure returned once retries are exhausted or the error is
/// not retryable.
#[derive(Debug)]
pub struct BackoffError<E> {
    /// The error from the final attempt.
    pub last_error: E,
    /// Total attempts made, including the first call.
    pub attempts: u32,
}

impl<E: fmt::Display> fmt::Display for BackoffError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "giving up after {} attempt(s): {}",
            self.attempts, self.last_error
        )
    }
}

impl<E: fmt::Display + fmt::Debug> std::error::Error for BackoffError<E> {}

/// Snapshot of the retry state for one key.
#[derive(Debug, Clone)]
pub struct BackoffStatus {
    /// Retries recorded so far.
    pub attempts: u32,
    /// When the most recent failure was recorded.
    pub last_attempt: DateTime<Utc>,
    /// Delay that would precede the next retry.
    pub next_delay: Duration,
}

#[derive(Debug)]
struct KeyState {
    attempts: u32,
    last_attempt: DateTime<Utc>,
}

/// Tracks retry state per key and drives bounded retry loops.
#[derive(Debug)]
pub struct BackoffCoordinator {
    config: BackoffConfig,
    state: Mutex<HashMap<String, KeyState>>,
}

impl BackoffCoordinator {
    /// Create a coordinator with the given parameters.
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Run `operation` under this key, retrying retryable failures with
    /// exponentially growing, jittered delays.
    ///
    /// `should_retry` classifies errors; a `false` verdict ends the loop
    /// immediately. The key's state is cleared on success and on terminal
    /// failure, so the next engagement starts from a clean slate.
    pub async fn execute<T, E, F, Fut, R>(
        &self,
        key: &str,
        mut operation: F,
        should_retry: R,
    ) -> std::result::Result<T, BackoffError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        R: Fn(&E) -> bool,
        E: fmt::Display,
    {
        let max_attempts = self.config.max_retries.saturating_add(1);
        for attempt in 1..=max_attempts {
            match operation().await {
                Ok(value) => {
                    self.clear(key).await;
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= max_attempts || !should_retry(&err) {
                        warn!(key, attempts = attempt, error = %err, "operation failed terminally");
                        self.clear(key).await;
                        return Err(BackoffError {
                            last_error: err,
                            attempts: attempt,
                        });
                    }
                    let delay = self.record_failure(key).await;
                    debug!(
                        key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        unreachable!("retry loop is bounded by max_attempts")
    }

    /// Retry state for `key`, if any failures are currently recorded.
    pub async fn status(&self, key: &str) -> Option<BackoffStatus> {
        let state = self.state.lock().await;
        state.get(key).map(|entry| BackoffStatus {
            attempts: entry.attempts,
            last_attempt: entry.last_attempt,
            next_delay: self.calculate_delay(entry.attempts + 1),
        })
    }

    /// Record a failure for `key` and return the delay to sleep before the
    /// next attempt. The state lock is released before the caller sleeps.
    async fn record_failure(&self, key: &str) -> Duration {
        let mut state = self.state.lock().await;
        let entry = state.entry(key.to_string()).or_insert(KeyState {
            attempts: 0,
            last_attempt: Utc::now(),
        });
        entry.attempts += 1;
        entry.last_attempt = Utc::now();
        let retry = entry.attempts;
        drop(state);
        self.calculate_delay(retry)
    }

    async fn clear(&self, key: &str) {
        self.state.lock().await.remove(key);
    }

    /// Delay for the given retry ordinal (1 = first retry).
    fn calculate_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31) as i32;
        let base = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = base.min(self.config.max_delay_ms as f64) as i64;
        let jitter_bound = self.config.jitter_ms as i64;
        let jitter = if jitter_bound == 0 {
            0
        } else {
            rand::thread_rng().gen_range(-jitter_bound..=jitter_bound)
        };
        Duration::from_millis(capped.saturating_add(jitter).max(0) as u64)
    }
}
