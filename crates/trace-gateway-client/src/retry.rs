// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded retries with exponential backoff for the initial create/update call.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::{DEFAULT_MAX_RETRIES, DEFAULT_RETRY_BACKOFF_MS};
use crate::error::{ConfigError, RetryError};

/// Retry budget for a single operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_backoff: Duration) -> Result<Self, ConfigError> {
        if base_backoff.is_zero() {
            return Err(ConfigError::Invalid(
                "retry backoff must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            max_retries,
            base_backoff,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_backoff(&self) -> Duration {
        self.base_backoff
    }

    /// Delay before the retry that follows failure number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_backoff.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

/// Suspends the caller without blocking a thread.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Runs `operation` up to `max_retries + 1` times.
///
/// Any `Err` is retried after `policy.backoff(i)`. An `Ok` is returned as is, so a well-formed
/// response carrying a rejection status is never retried here.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    sleeper: &dyn Sleeper,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(label, attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt < policy.max_retries => {
                let backoff = policy.backoff(attempt);
                warn!(
                    label,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    "attempt failed, retrying: {e}"
                );
                sleeper.sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => {
                error!(label, attempts = attempt + 1, "giving up: {e}");
                return Err(RetryError {
                    label: label.to_string(),
                    attempts: attempt + 1,
                    source: e,
                });
            }
        }
    }
}
