//! Rate limiting logic and state management.

mod clock;
mod decision;
mod key;
mod limiter;
mod rules;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{
    Decision, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER,
};
pub use key::RateLimitKey;
pub use limiter::{FailurePolicy, RateLimiter, DEFAULT_SWEEP_EVERY};
pub use rules::{default_rules, LimitRule, LimiterRegistry};
pub use window::{RateLimitRecord, Step, Transition, WindowPolicy};
