//! Fixed-window counting policy and the per-key state machine.

use serde::{Deserialize, Serialize};

use super::decision::Decision;
use crate::error::{Result, TurnstileError};

/// Limit and window length for one operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowPolicy {
    /// Maximum admitted requests per window
    pub max_requests: u64,
    /// Window length in seconds
    pub window_seconds: u64,
}

/// Persisted counter state for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Requests admitted in the current window
    pub count: u64,
    /// Epoch second at which the current window began
    pub window_start: i64,
}

/// Which transition a check performed on the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First request ever seen for the key
    Create,
    /// Same window, count + 1
    Increment,
    /// Previous window elapsed, count restarts at 1
    Roll,
    /// Ceiling reached; stored state is left untouched
    Reject,
}

/// Result of advancing a key's state by one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub transition: Transition,
    pub decision: Decision,
    /// Record to persist, `None` when nothing changes
    pub record: Option<RateLimitRecord>,
}

impl RateLimitRecord {
    /// A record for a window opened at `now` with one admitted request.
    pub fn opened_at(now: i64) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    /// Whether the record has gone untouched for two full windows.
    pub fn is_stale(&self, now: i64, policy: &WindowPolicy) -> bool {
        self.window_start <= policy.stale_cutoff(now)
    }
}

impl WindowPolicy {
    /// Create a policy, rejecting zero limits or zero-length windows.
    pub fn new(max_requests: u64, window_seconds: u64) -> Result<Self> {
        if max_requests == 0 {
            return Err(TurnstileError::Config(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        if window_seconds == 0 || window_seconds > i64::MAX as u64 / 2 {
            return Err(TurnstileError::Config(format!(
                "window_seconds must be between 1 and {}",
                i64::MAX / 2
            )));
        }
        Ok(Self {
            max_requests,
            window_seconds,
        })
    }

    fn window_secs_i64(&self) -> i64 {
        self.window_seconds as i64
    }

    /// Latest `window_start` still considered stale at `now`: two full
    /// windows back.
    pub fn stale_cutoff(&self, now: i64) -> i64 {
        now.saturating_sub(self.window_secs_i64().saturating_mul(2))
    }

    /// Whether the window that started at `window_start` has elapsed.
    ///
    /// A start in the future (clock skew between workers) counts as the
    /// current window, so `window_start` never moves backwards.
    fn has_elapsed(&self, window_start: i64, now: i64) -> bool {
        now.saturating_sub(window_start) >= self.window_secs_i64()
    }

    fn reset_at(&self, window_start: i64) -> i64 {
        window_start.saturating_add(self.window_secs_i64())
    }

    fn retry_after(&self, window_start: i64, now: i64) -> u64 {
        let wait = self.reset_at(window_start).saturating_sub(now);
        wait.clamp(1, self.window_secs_i64()) as u64
    }

    fn opened(&self, transition: Transition, now: i64) -> Step {
        Step {
            transition,
            decision: Decision::admit(self.max_requests, self.max_requests - 1, self.reset_at(now)),
            record: Some(RateLimitRecord::opened_at(now)),
        }
    }

    /// Advance a key's state by one request arriving at `now`.
    pub fn advance(&self, current: Option<RateLimitRecord>, now: i64) -> Step {
        let record = match current {
            None => return self.opened(Transition::Create, now),
            Some(record) if self.has_elapsed(record.window_start, now) => {
                return self.opened(Transition::Roll, now)
            }
            Some(record) => record,
        };

        let reset_at = self.reset_at(record.window_start);

        if record.count >= self.max_requests {
            return Step {
                transition: Transition::Reject,
                decision: Decision::reject(
                    self.max_requests,
                    reset_at,
                    self.retry_after(record.window_start, now),
                ),
                record: None,
            };
        }

        let count = record.count + 1;
        Step {
            transition: Transition::Increment,
            decision: Decision::admit(self.max_requests, self.max_requests - count, reset_at),
            record: Some(RateLimitRecord {
                count,
                window_start: record.window_start,
            }),
        }
    }

    /// The status a caller would see right now, without consuming quota.
    pub fn inspect(&self, current: Option<RateLimitRecord>, now: i64) -> Decision {
        match current {
            Some(record) if !self.has_elapsed(record.window_start, now) => {
                let reset_at = self.reset_at(record.window_start);
                if record.count >= self.max_requests {
                    Decision::reject(
                        self.max_requests,
                        reset_at,
                        self.retry_after(record.window_start, now),
                    )
                } else {
                    Decision::admit(self.max_requests, self.max_requests - record.count, reset_at)
                }
            }
            _ => Decision::admit(self.max_requests, self.max_requests, self.reset_at(now)),
        }
    }
}
