use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rollcall_core::config::ResilienceConfig;
use serde::Serialize;

use crate::breaker::{BreakerSettings, BreakerSnapshot, CircuitBreaker};
use crate::error::{ResilienceError, Transient};
use crate::retry::{retry, RetryPolicy};

/// External systems the process talks to. Each gets its own breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Dependency {
    Api,
    Email,
    Printer,
    Webhook,
}

impl Dependency {
    pub const ALL: [Dependency; 4] = [
        Dependency::Api,
        Dependency::Email,
        Dependency::Printer,
        Dependency::Webhook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dependency::Api => "api",
            Dependency::Email => "email",
            Dependency::Printer => "printer",
            Dependency::Webhook => "webhook",
        }
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Owns one circuit breaker and one retry policy per [`Dependency`].
///
/// Share it as `Arc<Resilience>`; breakers are created on first use and live
/// for the whole process (state is never persisted).
pub struct Resilience {
    breakers: DashMap<Dependency, Arc<CircuitBreaker>>,
    policies: HashMap<Dependency, RetryPolicy>,
    breaker_settings: BreakerSettings,
}

impl Resilience {
    /// Same retry policy and breaker settings for every dependency.
    pub fn new(policy: RetryPolicy, breaker_settings: BreakerSettings) -> Self {
        let policies = Dependency::ALL
            .into_iter()
            .map(|dep| (dep, policy.clone()))
            .collect();
        Self {
            breakers: DashMap::new(),
            policies,
            breaker_settings,
        }
    }

    /// Build from config, giving each dependency its own attempt timeout.
    pub fn from_config(cfg: &ResilienceConfig) -> Self {
        let breaker_settings = BreakerSettings::from(&cfg.breaker);
        let timeout = |dep: Dependency| -> u64 {
            match dep {
                Dependency::Api => cfg.timeouts.api_secs,
                Dependency::Email => cfg.timeouts.email_secs,
                Dependency::Printer => cfg.timeouts.printer_secs,
                Dependency::Webhook => cfg.timeouts.webhook_secs,
            }
        };
        let policies = Dependency::ALL
            .into_iter()
            .map(|dep| {
                let policy = RetryPolicy::from_config(
                    &cfg.retry,
                    Some(Duration::from_secs(timeout(dep))),
                );
                (dep, policy)
            })
            .collect();
        Self {
            breakers: DashMap::new(),
            policies,
            breaker_settings,
        }
    }

    /// Override the retry policy of a single dependency.
    pub fn with_policy(mut self, dep: Dependency, policy: RetryPolicy) -> Self {
        self.policies.insert(dep, policy);
        self
    }

    pub fn breaker(&self, dep: Dependency) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(dep)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(dep.as_str(), self.breaker_settings.clone()))
            })
            .clone()
    }

    pub fn policy(&self, dep: Dependency) -> RetryPolicy {
        self.policies.get(&dep).cloned().unwrap_or_default()
    }

    /// Run `op` against `dep`: breaker admission, then retry with backoff,
    /// each attempt under the dependency's timeout.
    pub async fn call<T, E, F, Fut>(&self, dep: Dependency, op: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let breaker = self.breaker(dep);
        let policy = self.policy(dep);
        breaker
            .call(|| async move { retry(&policy, dep.as_str(), op).await })
            .await
    }

    /// State and stats of every dependency, in declaration order.
    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        Dependency::ALL
            .into_iter()
            .map(|dep| self.breaker(dep).snapshot())
            .collect()
    }

    pub fn reset(&self, dep: Dependency) {
        self.breaker(dep).reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("upstream down")]
    struct Down;

    impl Transient for Down {
        fn is_transient(&self) -> bool {
            true
        }
    }

    fn resilience() -> Resilience {
        Resilience::new(
            RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(10),
                jitter: Duration::ZERO,
                attempt_timeout: Some(Duration::from_secs(1)),
            },
            BreakerSettings {
                failure_threshold: 2,
                success_threshold: 1,
                reset_timeout: Duration::from_secs(60),
                half_open_max_calls: 1,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn one_logical_call_is_one_breaker_outcome() {
        let r = resilience();
        let calls = AtomicU32::new(0);
        let res: Result<(), _> = r
            .call(Dependency::Api, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Down)
            })
            .await;
        assert!(res.is_err());
        // two attempts inside, one failure on the breaker
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(r.breaker(Dependency::Api).stats().failures, 1);
        assert_eq!(r.breaker(Dependency::Api).state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn breakers_are_independent_per_dependency() {
        let r = resilience();
        for _ in 0..2 {
            let _: Result<(), _> = r.call(Dependency::Email, || async { Err(Down) }).await;
        }
        assert_eq!(r.breaker(Dependency::Email).state(), CircuitState::Open);
        assert_eq!(r.breaker(Dependency::Api).state(), CircuitState::Closed);

        let res = r
            .call(Dependency::Api, || async { Ok::<_, Down>(7) })
            .await;
        assert_eq!(res.unwrap(), 7);

        let rejected = r
            .call(Dependency::Email, || async { Ok::<_, Down>(()) })
            .await;
        assert!(matches!(rejected, Err(ResilienceError::CircuitOpen { ref dependency }) if dependency == "email"));
        assert!(rejected.unwrap_err().is_transient());

        r.reset(Dependency::Email);
        assert_eq!(r.breaker(Dependency::Email).state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn policy_override_applies_to_one_dependency() {
        let r = resilience().with_policy(Dependency::Webhook, RetryPolicy::no_retry(None));
        let calls = AtomicU32::new(0);
        let _: Result<(), _> = r
            .call(Dependency::Webhook, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Down)
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.policy(Dependency::Api).max_attempts, 2);
    }

    #[test]
    fn snapshot_lists_every_dependency() {
        let r = Resilience::from_config(&ResilienceConfig::default());
        let names: Vec<_> = r.snapshot().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["api", "email", "printer", "webhook"]);
        assert_eq!(
            r.policy(Dependency::Webhook).attempt_timeout,
            Some(Duration::from_secs(10))
        );
    }
}
