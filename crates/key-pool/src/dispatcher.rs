//! Rotation and pool-level retry over the key pool
//!
//! One `execute` call runs one or more passes. A pass starts at a random
//! index and tries every client exactly once, in order, until one succeeds.
//! Attempts are strictly sequential. After a failed pass only the last
//! error is inspected: a quota failure with a short suggested wait earns
//! another pass (while the retry budget lasts); anything else is returned.
//!
//! Per call:
//! - Idle → InPass (pool non-empty) or Failed (empty pool)
//! - InPass → Succeeded (any attempt succeeds)
//! - InPass → AwaitingBackoff (quota, wait < ceiling, budget left)
//! - InPass → Failed (not quota, wait too long, or budget spent)
//! - AwaitingBackoff → InPass (after the wait)

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use backend::BackendError;
use rand::RngExt;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::pool::Pool;
use crate::quota::{self, ErrorClassification};

/// Backoff settings for pool-level retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra full passes allowed after the first one fails
    pub max_pool_retries: u32,
    /// Wait used when a quota error carries no retry hint
    pub default_wait: Duration,
    /// Added to the server-suggested wait
    pub wait_margin: Duration,
    /// Waits at or above this give up instead of sleeping
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_pool_retries: 1,
            default_wait: Duration::from_millis(2000),
            wait_margin: Duration::from_millis(500),
            max_wait: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_pool_retries(mut self, retries: u32) -> Self {
        self.max_pool_retries = retries;
        self
    }

    /// Wait before the next pass after a quota failure.
    ///
    /// Suggested wait plus margin, or the default wait when the error has
    /// no hint.
    pub fn wait_for(&self, err: &BackendError) -> Duration {
        match quota::suggested_wait(err) {
            Some(suggested) => suggested.saturating_add(self.wait_margin),
            None => self.default_wait,
        }
    }
}

/// Uniformly random starting index in `[0, size)`.
fn random_start(size: usize) -> usize {
    rand::rng().random_range(0..size)
}

/// Runs operations against the pool with rotation and bounded retry.
///
/// Holds no mutable state; concurrent `execute` calls share the pool
/// without coordination.
pub struct Dispatcher<C> {
    pool: Arc<Pool<C>>,
    policy: RetryPolicy,
    pick_start: fn(usize) -> usize,
}

impl<C> Dispatcher<C> {
    pub fn new(pool: Arc<Pool<C>>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            pick_start: random_start,
        }
    }

    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` against the pool until it succeeds or retries are spent.
    ///
    /// Returns `Error::Configuration` without invoking the operation when the
    /// pool is empty. Otherwise a failure is the last attempt's error, unchanged.
    pub async fn execute<'a, T, F, Fut>(&'a self, mut operation: F) -> Result<T>
    where
        F: FnMut(&'a C) -> Fut,
        Fut: Future<Output = backend::Result<T>>,
    {
        if self.pool.is_empty() {
            metrics::counter!("dispatch_failures_total", "reason" => "no_keys").increment(1);
            return Err(Error::no_keys());
        }

        let mut retries_left = self.policy.max_pool_retries;
        let mut pass = 0u32;

        loop {
            let err = match self.run_pass(&mut operation, pass).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if quota::classify(&err) != ErrorClassification::QuotaExceeded {
                metrics::counter!("dispatch_failures_total", "reason" => "backend").increment(1);
                return Err(err.into());
            }

            let wait = self.policy.wait_for(&err);
            if wait >= self.policy.max_wait || retries_left == 0 {
                warn!(
                    pass,
                    wait_ms = wait.as_millis() as u64,
                    retries_left,
                    "all keys exhausted, not retrying pool"
                );
                metrics::counter!("dispatch_failures_total", "reason" => "backend").increment(1);
                return Err(err.into());
            }

            info!(
                pass,
                wait_ms = wait.as_millis() as u64,
                "all keys exhausted, waiting before retrying pool"
            );
            metrics::counter!("dispatch_pool_retries_total").increment(1);
            tokio::time::sleep(wait).await;
            retries_left -= 1;
            pass += 1;
        }
    }

    /// Try every client once from a fresh start index.
    ///
    /// Every failure moves on to the next client regardless of its
    /// classification. Returns the last error if all clients fail.
    async fn run_pass<'a, T, F, Fut>(&'a self, operation: &mut F, pass: u32) -> backend::Result<T>
    where
        F: FnMut(&'a C) -> Fut,
        Fut: Future<Output = backend::Result<T>>,
    {
        let size = self.pool.size();
        let start = (self.pick_start)(size);
        let mut offset = 0;

        loop {
            let key_index = (start + offset) % size;
            match operation(self.pool.get(key_index)).await {
                Ok(value) => {
                    metrics::counter!("dispatch_attempts_total", "outcome" => "success")
                        .increment(1);
                    debug!(key_index, pass, attempt = offset + 1, "attempt succeeded");
                    return Ok(value);
                }
                Err(e) => {
                    let classification = quota::classify(&e);
                    metrics::counter!("dispatch_attempts_total", "outcome" => classification.label())
                        .increment(1);
                    warn!(
                        key_index,
                        pass,
                        classification = classification.label(),
                        error = %e,
                        "attempt failed, rotating to next key"
                    );
                    offset += 1;
                    if offset == size {
                        return Err(e);
                    }
                }
            }
        }
    }
}
