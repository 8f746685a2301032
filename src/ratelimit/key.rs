//! Rate limit key generation and handling.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};

/// A key that uniquely identifies one counter.
///
/// The key is composed of the operation class (e.g. `auth`, `api`) and the
/// caller identity, so the same caller keeps independent counters per
/// operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RateLimitKey {
    /// The operation class this counter belongs to
    pub operation: String,
    /// The resolved caller identity, typically an IP address
    pub identity: String,
}

impl RateLimitKey {
    /// Create a new key, rejecting empty operation or identity values.
    ///
    /// The operation may not contain `:` since it is the rendered separator.
    pub fn new(operation: &str, identity: &str) -> Result<Self> {
        let operation = operation.trim();
        let identity = identity.trim();

        if operation.is_empty() {
            return Err(TurnstileError::InvalidKey(
                "operation key must not be empty".to_string(),
            ));
        }
        if operation.contains(':') {
            return Err(TurnstileError::InvalidKey(format!(
                "operation key {:?} must not contain ':'",
                operation
            )));
        }
        if identity.is_empty() {
            return Err(TurnstileError::InvalidKey(
                "identity must not be empty".to_string(),
            ));
        }

        Ok(Self {
            operation: operation.to_string(),
            identity: identity.to_string(),
        })
    }

    /// Parse a rendered `operation:identity` key.
    ///
    /// Splits at the first colon so IPv6 identities survive intact.
    pub fn parse(rendered: &str) -> Result<Self> {
        match rendered.split_once(':') {
            Some((operation, identity)) => Self::new(operation, identity),
            None => Err(TurnstileError::InvalidKey(format!(
                "missing ':' separator in {:?}",
                rendered
            ))),
        }
    }

    /// Convert the key to its rendered string form.
    pub fn to_string_key(&self) -> String {
        format!("{}:{}", self.operation, self.identity)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.operation, self.identity)
    }
}
