//! The outcome of a rate limit check.

use serde::{Deserialize, Serialize};

/// Header carrying the configured ceiling.
pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
/// Header carrying the requests left in the current window.
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
/// Header carrying the absolute epoch second at which the window ends.
pub const HEADER_RESET: &str = "x-ratelimit-reset";
/// Standard header carrying the wait, in seconds, after a rejection.
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Admission decision for a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether the request may proceed
    pub admitted: bool,
    /// Configured maximum requests per window
    pub limit: u64,
    /// Requests left in the current window after this decision
    pub remaining: u64,
    /// Epoch second at which the current window ends
    pub reset_at: i64,
    /// Seconds to wait before retrying, only set on rejection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl Decision {
    /// An admitting decision.
    pub fn admit(limit: u64, remaining: u64, reset_at: i64) -> Self {
        Self {
            admitted: true,
            limit,
            remaining,
            reset_at,
            retry_after_seconds: None,
        }
    }

    /// A rejecting decision.
    pub fn reject(limit: u64, reset_at: i64, retry_after_seconds: u64) -> Self {
        Self {
            admitted: false,
            limit,
            remaining: 0,
            reset_at,
            retry_after_seconds: Some(retry_after_seconds),
        }
    }

    /// Advisory response headers describing this decision.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset_at.to_string()),
        ];
        if let Some(retry_after) = self.retry_after_seconds {
            headers.push((HEADER_RETRY_AFTER, retry_after.to_string()));
        }
        headers
    }
}
