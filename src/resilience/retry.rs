// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded exponential backoff for opening local storage.
//!
//! Remote provider calls are never retried: a failed call goes straight to
//! the local fallback. The only thing worth waiting for is the local SQLite
//! file, which can be briefly locked by a previous process on restart.
//!
//! # Example
//!
//! ```
//! use record_sync::RetryConfig;
//!
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//! assert!(startup.delay_for(10) <= startup.max_delay);
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

/// Backoff schedule for [`retry`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts, the first one included
    pub max_attempts: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::startup()
    }
}

impl RetryConfig {
    /// Five attempts over roughly three seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_attempts: 5,
        }
    }

    /// Delay after the `failed`-th failed attempt (1-based).
    #[must_use]
    pub fn delay_for(&self, failed: usize) -> Duration {
        let exponent = failed.saturating_sub(1).min(32) as i32;
        self.initial_delay
            .mul_f64(self.factor.powi(exponent))
            .min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is used up,
/// returning the last error.
pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut failed = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if failed > 0 {
                    debug!(operation = operation_name, retries = failed, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(err) => {
                failed += 1;
                if failed >= config.max_attempts.max(1) {
                    return Err(err);
                }
                let delay = config.delay_for(failed);
                warn!(
                    operation = operation_name,
                    attempt = failed,
                    max_attempts = config.max_attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
