//! Core rate limiter implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::clock::Clock;
use super::decision::Decision;
use super::key::RateLimitKey;
use super::window::{Step, Transition, WindowPolicy};
use crate::error::Result;
use crate::store::{CounterStore, StoreError};

/// Default number of checks between opportunistic sweeps.
pub const DEFAULT_SWEEP_EVERY: u64 = 100;

/// What to do when the counter store cannot be reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request and log a warning
    #[default]
    Open,
    /// Reject the request and log a warning
    Closed,
}

/// A fixed-window rate limiter for one operation class.
///
/// The limiter holds no counts of its own; every decision is a single
/// atomic update against the shared [`CounterStore`]. It is cheap to share
/// behind an `Arc` across request handlers.
pub struct RateLimiter {
    /// Operation key this limiter guards
    operation: String,
    policy: WindowPolicy,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
    /// Run a sweep every N checks; 0 disables sweeping
    sweep_every: u64,
    checks: AtomicU64,
}

impl RateLimiter {
    /// Create a new rate limiter for `operation`.
    pub fn new(
        operation: &str,
        policy: WindowPolicy,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            operation: operation.to_string(),
            policy,
            store,
            clock,
            failure_policy: FailurePolicy::default(),
            sweep_every: DEFAULT_SWEEP_EVERY,
            checks: AtomicU64::new(0),
        }
    }

    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn with_sweep_every(mut self, sweep_every: u64) -> Self {
        self.sweep_every = sweep_every;
        self
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn policy(&self) -> WindowPolicy {
        self.policy
    }

    /// Check and consume quota for `identity` under this limiter's own operation key.
    pub async fn check_identity(&self, identity: &str) -> Result<Decision> {
        self.check(identity, &self.operation).await
    }

    /// Check the rate limit for a caller and operation.
    ///
    /// Admitted requests are counted; rejected requests leave the stored
    /// state unchanged. Only an invalid key is returned as an error: store
    /// failures are resolved by the configured [`FailurePolicy`].
    pub async fn check(&self, identity: &str, operation: &str) -> Result<Decision> {
        let key = RateLimitKey::new(operation, identity)?;
        let now = self.clock.now();
        let policy = self.policy;

        trace!(key = %key, now = now, "Checking rate limit");

        let mut step: Option<Step> = None;
        let updated = self
            .store
            .update(&key, &mut |current| {
                let next = policy.advance(current, now);
                step = Some(next);
                next.record
            })
            .await;

        let decision = match updated.and_then(|_| {
            step.ok_or_else(|| StoreError::Unavailable("store skipped the update".to_string()))
        }) {
            Ok(step) => {
                self.log_step(&key, &step);
                step.decision
            }
            Err(error) => self.degraded(&key, now, &error),
        };

        self.maybe_sweep().await;
        Ok(decision)
    }

    /// Report the current status for a caller without consuming quota.
    pub async fn status(&self, identity: &str, operation: &str) -> Result<Decision> {
        let key = RateLimitKey::new(operation, identity)?;
        let now = self.clock.now();

        match self.store.get(&key).await {
            Ok(current) => Ok(self.policy.inspect(current, now)),
            Err(error) => Ok(self.degraded(&key, now, &error)),
        }
    }

    /// Forget the counter for a caller, e.g. after a successful login.
    pub async fn reset(&self, identity: &str, operation: &str) -> Result<bool> {
        let key = RateLimitKey::new(operation, identity)?;
        let removed = self.store.remove(&key).await?;
        debug!(key = %key, removed = removed, "Rate limit counter reset");
        Ok(removed)
    }

    /// Delete this operation's records untouched for two full windows.
    pub async fn sweep(&self) -> usize {
        let cutoff = self.policy.stale_cutoff(self.clock.now());

        match self.store.purge_stale(&self.operation, cutoff).await {
            Ok(purged) => {
                if purged > 0 {
                    debug!(operation = %self.operation, purged = purged, "Swept stale counters");
                }
                purged
            }
            Err(error) => {
                warn!(operation = %self.operation, error = %error, "Stale counter sweep failed");
                0
            }
        }
    }

    async fn maybe_sweep(&self) {
        if self.sweep_every == 0 {
            return;
        }
        let checks = self.checks.fetch_add(1, Ordering::Relaxed) + 1;
        if checks % self.sweep_every == 0 {
            self.sweep().await;
        }
    }

    fn log_step(&self, key: &RateLimitKey, step: &Step) {
        match step.transition {
            Transition::Reject => debug!(
                key = %key,
                limit = self.policy.max_requests,
                retry_after = ?step.decision.retry_after_seconds,
                "Rate limit exceeded"
            ),
            Transition::Roll => trace!(key = %key, "Window elapsed, counter restarted"),
            Transition::Create => debug!(
                key = %key,
                limit = self.policy.max_requests,
                window_seconds = self.policy.window_seconds,
                "Creating new rate limit counter"
            ),
            Transition::Increment => {
                trace!(key = %key, remaining = step.decision.remaining, "Request counted")
            }
        }
    }

    fn degraded(&self, key: &RateLimitKey, now: i64, error: &StoreError) -> Decision {
        let limit = self.policy.max_requests;
        let window = self.policy.window_seconds;
        let reset_at = now.saturating_add(window as i64);

        match self.failure_policy {
            FailurePolicy::Open => {
                warn!(key = %key, error = %error, "Counter store failed, admitting request");
                Decision::admit(limit, limit, reset_at)
            }
            FailurePolicy::Closed => {
                warn!(key = %key, error = %error, "Counter store failed, rejecting request");
                Decision::reject(limit, reset_at, window)
            }
        }
    }
}
