// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backoff and bounded retries for backend calls.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::Config;
use crate::framework::BackendError;

/// Retry delay growth.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Cap on any delay.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(200),
            max: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay for `attempt` (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// How backend calls are bounded and retried.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Delay growth between attempts.
    pub backoff: BackoffPolicy,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Bound on each attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_retries: 3,
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Policy from control-plane configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_retries: config.backend_max_retries,
            timeout: config.backend_timeout,
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out.
///
/// Each attempt is bounded by `policy.timeout`; an elapsed attempt counts as
/// [`BackendError::Timeout`], which is retryable.
pub async fn retry_backend<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let mut attempt = 0;
    loop {
        let result = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(policy.timeout)),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.backoff.next(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Backend call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
