//! Rate limit rules and the per-operation limiter registry.
//!
//! Each rule names an operation class and its fixed-window policy. The
//! registry turns a rule list into one [`RateLimiter`] per operation, all
//! sharing the same counter store, and can swap the rule table at runtime
//! without losing counters.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::clock::Clock;
use super::decision::Decision;
use super::key::RateLimitKey;
use super::limiter::{FailurePolicy, RateLimiter};
use super::window::WindowPolicy;
use crate::error::{Result, TurnstileError};
use crate::store::CounterStore;

/// A rate limit rule for one operation class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Operation key, e.g. `auth` or `api`
    pub operation: String,
    /// Maximum admitted requests per window
    pub max_requests: u64,
    /// Window length in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
}

fn default_window_seconds() -> u64 {
    60
}

impl LimitRule {
    pub fn new(operation: &str, max_requests: u64, window_seconds: u64) -> Self {
        Self {
            operation: operation.to_string(),
            max_requests,
            window_seconds,
        }
    }

    /// Validate the rule and produce its window policy.
    pub fn policy(&self) -> Result<WindowPolicy> {
        // Reuse key validation for the operation name.
        RateLimitKey::new(&self.operation, "-")
            .map_err(|e| TurnstileError::Config(format!("rule {:?}: {}", self.operation, e)))?;
        WindowPolicy::new(self.max_requests, self.window_seconds)
            .map_err(|e| TurnstileError::Config(format!("rule {:?}: {}", self.operation, e)))
    }
}

/// The stock rule set: login, registration and general API traffic.
pub fn default_rules() -> Vec<LimitRule> {
    vec![
        LimitRule::new("auth", 10, 60),
        LimitRule::new("register", 3, 60),
        LimitRule::new("api", 100, 60),
    ]
}

/// Limiters indexed by operation key.
pub struct LimiterRegistry {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
    sweep_every: u64,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
}

impl LimiterRegistry {
    /// Build a registry from a rule list.
    pub fn from_rules(
        rules: &[LimitRule],
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
        failure_policy: FailurePolicy,
        sweep_every: u64,
    ) -> Result<Self> {
        let registry = Self {
            store,
            clock,
            failure_policy,
            sweep_every,
            limiters: RwLock::new(HashMap::new()),
        };
        registry.reload(rules)?;
        Ok(registry)
    }

    fn build(&self, rules: &[LimitRule]) -> Result<HashMap<String, Arc<RateLimiter>>> {
        let mut limiters = HashMap::with_capacity(rules.len());

        for rule in rules {
            let policy = rule.policy()?;
            let operation = rule.operation.trim().to_string();
            let limiter = RateLimiter::new(&operation, policy, self.store.clone(), self.clock.clone())
                .with_failure_policy(self.failure_policy)
                .with_sweep_every(self.sweep_every);

            if limiters.insert(operation.clone(), Arc::new(limiter)).is_some() {
                return Err(TurnstileError::Config(format!(
                    "duplicate rule for operation {:?}",
                    operation
                )));
            }
        }

        Ok(limiters)
    }

    /// Replace the rule table. Counters in the shared store are kept.
    ///
    /// On error the previous table stays in effect.
    pub fn reload(&self, rules: &[LimitRule]) -> Result<()> {
        let limiters = self.build(rules)?;

        for limiter in limiters.values() {
            let policy = limiter.policy();
            info!(
                operation = %limiter.operation(),
                max_requests = policy.max_requests,
                window_seconds = policy.window_seconds,
                "Rate limit rule loaded"
            );
        }

        *self.limiters.write() = limiters;
        Ok(())
    }

    /// Get the limiter for an operation. Surrounding whitespace is ignored.
    pub fn get(&self, operation: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.read().get(operation.trim()).cloned()
    }

    fn require(&self, operation: &str) -> Result<Arc<RateLimiter>> {
        self.get(operation)
            .ok_or_else(|| TurnstileError::UnknownOperation(operation.to_string()))
    }

    /// Registered operation keys, sorted.
    pub fn operations(&self) -> Vec<String> {
        let mut operations: Vec<String> = self.limiters.read().keys().cloned().collect();
        operations.sort();
        operations
    }

    /// Check and consume quota for `identity` under `operation`.
    pub async fn check(&self, identity: &str, operation: &str) -> Result<Decision> {
        self.require(operation)?.check(identity, operation).await
    }

    /// Non-mutating status for `identity` under `operation`.
    pub async fn status(&self, identity: &str, operation: &str) -> Result<Decision> {
        self.require(operation)?.status(identity, operation).await
    }

    /// Forget the counter for `identity` under `operation`.
    pub async fn reset(&self, identity: &str, operation: &str) -> Result<bool> {
        self.require(operation)?.reset(identity, operation).await
    }

    /// Sweep stale records for every operation.
    pub async fn sweep(&self) -> usize {
        let limiters: Vec<Arc<RateLimiter>> = self.limiters.read().values().cloned().collect();
        let mut purged = 0;
        for limiter in limiters {
            purged += limiter.sweep().await;
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::store::MemoryStore;

    fn create_registry(rules: &[LimitRule]) -> Result<LimiterRegistry> {
        LimiterRegistry::from_rules(
            rules,
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(0)),
            FailurePolicy::Open,
            0,
        )
    }

    #[test]
    fn test_parse_rules_yaml() {
        let yaml = r#"
- operation: auth
  max_requests: 10
- operation: upload
  max_requests: 5
  window_seconds: 3600
"#;
        let rules: Vec<LimitRule> = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(rules[0], LimitRule::new("auth", 10, 60));
        assert_eq!(rules[1], LimitRule::new("upload", 5, 3600));
    }

    #[test]
    fn test_default_rules() {
        let registry = create_registry(&default_rules()).unwrap();
        assert_eq!(registry.operations(), vec!["api", "auth", "register"]);
        assert_eq!(registry.get("auth").unwrap().policy().max_requests, 10);
        assert_eq!(registry.get("register").unwrap().policy().max_requests, 3);
    }

    #[test]
    fn test_invalid_rules_rejected() {
        let zero = [LimitRule::new("api", 0, 60)];
        assert!(matches!(create_registry(&zero), Err(TurnstileError::Config(_))));

        let duplicate = [LimitRule::new("api", 1, 60), LimitRule::new("api", 2, 60)];
        assert!(matches!(create_registry(&duplicate), Err(TurnstileError::Config(_))));

        let bad_name = [LimitRule::new("api:v2", 1, 60)];
        assert!(matches!(create_registry(&bad_name), Err(TurnstileError::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let registry = create_registry(&default_rules()).unwrap();

        let result = registry.check("1.2.3.4", "upload").await;
        assert!(matches!(result, Err(TurnstileError::UnknownOperation(_))));
    }

    #[tokio::test]
    async fn test_groups_keep_independent_counters() {
        let rules = [LimitRule::new("auth", 3, 60), LimitRule::new("api", 3, 60)];
        let registry = create_registry(&rules).unwrap();

        for _ in 0..3 {
            assert!(registry.check("1.2.3.4", "auth").await.unwrap().admitted);
        }
        assert!(!registry.check("1.2.3.4", "auth").await.unwrap().admitted);

        let decision = registry.check("1.2.3.4", "api").await.unwrap();
        assert!(decision.admitted);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_lookup_ignores_surrounding_whitespace() {
        let registry = create_registry(&default_rules()).unwrap();

        assert!(registry.get(" auth ").is_some());
        let decision = registry.check("1.2.3.4", " auth").await.unwrap();
        assert_eq!(decision.remaining, 9);
    }

    #[tokio::test]
    async fn test_sweep_covers_every_operation() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::new());
        let registry = LimiterRegistry::from_rules(
            &[LimitRule::new("auth", 3, 60), LimitRule::new("upload", 3, 3600)],
            store.clone(),
            clock.clone(),
            FailurePolicy::Open,
            0,
        )
        .unwrap();

        registry.check("1.2.3.4", "auth").await.unwrap();
        registry.check("1.2.3.4", "upload").await.unwrap();

        // Two auth windows have passed; the hour-long upload window has not.
        clock.set(120);
        assert_eq!(registry.sweep().await, 1);
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reload_keeps_counters() {
        let registry = create_registry(&[LimitRule::new("api", 5, 60)]).unwrap();
        for _ in 0..3 {
            registry.check("1.2.3.4", "api").await.unwrap();
        }

        registry.reload(&[LimitRule::new("api", 3, 60)]).unwrap();

        // The three earlier admissions still count against the lowered limit.
        assert!(!registry.check("1.2.3.4", "api").await.unwrap().admitted);
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous_rules() {
        let registry = create_registry(&[LimitRule::new("api", 5, 60)]).unwrap();

        assert!(registry.reload(&[LimitRule::new("api", 0, 60)]).is_err());
        assert_eq!(registry.get("api").unwrap().policy().max_requests, 5);
    }
}
