//! Fixed-window admission decisions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::policy::Policy;
use super::record::{duration_millis, seconds_until, RateLimitRecord};
use super::store::WindowStore;

/// Outcome of evaluating one request against one policy.
///
/// Serialized in camelCase for clients that consume it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at_epoch_secs: u64,
    pub retry_after_secs: u64,
}

impl Decision {
    fn allow(limit: u64, remaining: u64, record: &RateLimitRecord) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at_epoch_secs: seconds_until(record.reset_at, 0),
            retry_after_secs: 0,
        }
    }

    fn reject(limit: u64, record: &RateLimitRecord, now: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at_epoch_secs: seconds_until(record.reset_at, 0),
            retry_after_secs: record.retry_after_secs(now),
        }
    }

    /// Decision for a request that was let through without being counted.
    pub fn unmetered(limit: u64, policy: &Policy, now: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at_epoch_secs: seconds_until(now.saturating_add(duration_millis(policy.window())), 0),
            retry_after_secs: 0,
        }
    }
}

/// Final result of a request as observed by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    /// Any 2xx status is a success.
    pub fn from_status(status: u16) -> Self {
        if (200..300).contains(&status) {
            Outcome::Success
        } else {
            Outcome::Failure
        }
    }
}

/// Pending compensation for an optimistically counted request.
///
/// Produced only for policies that skip successful requests. Consuming it
/// with a successful outcome gives the request back; dropping it keeps the
/// request counted.
#[derive(Debug)]
#[must_use = "dropping a completion hook keeps the request counted"]
pub struct CompletionHook {
    store: Arc<WindowStore>,
    policy: Arc<str>,
    key: String,
    window_start: u64,
}

impl CompletionHook {
    /// Report the request's outcome. Returns `true` if the count was reduced.
    pub fn complete(self, outcome: Outcome, now: u64) -> bool {
        match outcome {
            Outcome::Success => {
                self.store
                    .decrement(&self.policy, &self.key, self.window_start, now)
            }
            Outcome::Failure => false,
        }
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }
}

/// A decision plus the hook to settle it, if the policy needs one.
#[derive(Debug)]
pub struct Evaluation {
    pub decision: Decision,
    pub hook: Option<CompletionHook>,
}

enum Step {
    AlreadyBlocked,
    Blocked,
    Allowed,
}

/// Applies the fixed-window algorithm against a shared [`WindowStore`].
#[derive(Debug, Clone)]
pub struct PolicyEvaluator {
    store: Arc<WindowStore>,
}

impl PolicyEvaluator {
    pub fn new(store: Arc<WindowStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<WindowStore> {
        &self.store
    }

    /// Count a request for `key` under `policy` and decide whether to admit it.
    ///
    /// The request is counted before the threshold is checked, so the request
    /// that pushes the count past `max_requests` is itself rejected and the
    /// key stays blocked until the window ends.
    pub fn evaluate(&self, policy: &Policy, key: &str, max_requests: u64, now: u64) -> Evaluation {
        let window = policy.window();

        let (step, decision, window_start, count) =
            self.store.with_record(policy.id(), key, window, now, |record| {
                record.roll_if_expired(now, window);

                if record.blocked {
                    let decision = Decision::reject(max_requests, record, now);
                    return (Step::AlreadyBlocked, decision, record.window_start, record.count);
                }

                let count = record.increment();
                if count > max_requests {
                    record.blocked = true;
                    let decision = Decision::reject(max_requests, record, now);
                    return (Step::Blocked, decision, record.window_start, count);
                }

                let decision = Decision::allow(max_requests, max_requests - count, record);
                (Step::Allowed, decision, record.window_start, count)
            });

        match step {
            Step::AlreadyBlocked => {
                trace!(
                    policy = %policy.name(),
                    key = %key,
                    retry_after = decision.retry_after_secs,
                    "Rejected blocked key"
                );
                Evaluation { decision, hook: None }
            }
            Step::Blocked => {
                debug!(
                    policy = %policy.name(),
                    key = %key,
                    count,
                    limit = max_requests,
                    "Rate limit exceeded"
                );
                Evaluation { decision, hook: None }
            }
            Step::Allowed => {
                trace!(
                    policy = %policy.name(),
                    key = %key,
                    count,
                    remaining = decision.remaining,
                    "Request admitted"
                );
                let hook = policy.skips_successful_requests().then(|| CompletionHook {
                    store: Arc::clone(&self.store),
                    policy: Arc::clone(policy.id()),
                    key: key.to_string(),
                    window_start,
                });
                Evaluation { decision, hook }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn evaluator() -> PolicyEvaluator {
        PolicyEvaluator::new(Arc::new(WindowStore::new()))
    }

    fn count_of(evaluator: &PolicyEvaluator, policy: &Policy, key: &str) -> Option<u64> {
        evaluator
            .store()
            .snapshot(policy.id(), key)
            .map(|record| record.count)
    }

    #[test]
    fn test_ceiling_is_exact() {
        let evaluator = evaluator();
        let policy = Policy::new("global", Duration::from_millis(1000), 5);

        for i in 1..=5 {
            let decision = evaluator.evaluate(&policy, "a", 5, 0).decision;
            assert!(decision.allowed, "request {i} should be allowed");
            assert_eq!(decision.remaining, 5 - i);
        }

        let decision = evaluator.evaluate(&policy, "a", 5, 10).decision;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.limit, 5);
        assert!(decision.retry_after_secs > 0);
    }

    #[test]
    fn test_blocked_key_is_not_counted_further() {
        let evaluator = evaluator();
        let policy = Policy::new("global", Duration::from_millis(1000), 1);

        assert!(evaluator.evaluate(&policy, "a", 1, 0).decision.allowed);
        assert!(!evaluator.evaluate(&policy, "a", 1, 1).decision.allowed);
        assert!(!evaluator.evaluate(&policy, "a", 1, 2).decision.allowed);

        assert_eq!(count_of(&evaluator, &policy, "a"), Some(2));
    }

    #[test]
    fn test_blocked_until_window_ends() {
        let evaluator = evaluator();
        let policy = Policy::new("global", Duration::from_millis(1000), 1);

        evaluator.evaluate(&policy, "a", 1, 0);
        evaluator.evaluate(&policy, "a", 1, 0);

        // Exactly at reset_at the window has not ended yet.
        let decision = evaluator.evaluate(&policy, "a", 1, 1000).decision;
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, 0);

        let decision = evaluator.evaluate(&policy, "a", 1, 1001).decision;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_rollover_restores_full_quota() {
        let evaluator = evaluator();
        let policy = Policy::new("global", Duration::from_millis(1000), 3);

        for _ in 0..4 {
            evaluator.evaluate(&policy, "a", 3, 0);
        }

        let decision = evaluator.evaluate(&policy, "a", 3, 1500).decision;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
        assert_eq!(decision.reset_at_epoch_secs, 3);
    }

    #[test]
    fn test_higher_limit_applies_on_next_request() {
        let evaluator = evaluator();
        let policy = Policy::new("roles", Duration::from_secs(60), 2);

        assert!(evaluator.evaluate(&policy, "u", 2, 0).decision.allowed);
        assert!(evaluator.evaluate(&policy, "u", 2, 0).decision.allowed);

        // Same window, caller upgraded to a larger threshold.
        let decision = evaluator.evaluate(&policy, "u", 10, 0).decision;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 7);
    }

    #[test]
    fn test_hook_only_for_skip_successful_policies() {
        let evaluator = evaluator();
        let plain = Policy::new("plain", Duration::from_secs(1), 5);
        let skipping = Policy::new("auth", Duration::from_secs(1), 5).skip_successful_requests(true);

        assert!(evaluator.evaluate(&plain, "a", 5, 0).hook.is_none());
        assert!(evaluator.evaluate(&skipping, "a", 5, 0).hook.is_some());
    }

    #[test]
    fn test_successful_outcome_is_given_back() {
        let evaluator = evaluator();
        let policy = Policy::new("auth", Duration::from_secs(1), 3).skip_successful_requests(true);

        let hook = evaluator.evaluate(&policy, "a", 3, 0).hook.unwrap();
        assert_eq!(count_of(&evaluator, &policy, "a"), Some(1));

        assert!(hook.complete(Outcome::Success, 10));
        assert_eq!(count_of(&evaluator, &policy, "a"), Some(0));
    }

    #[test]
    fn test_failed_outcome_keeps_count() {
        let evaluator = evaluator();
        let policy = Policy::new("auth", Duration::from_secs(1), 3).skip_successful_requests(true);

        let hook = evaluator.evaluate(&policy, "a", 3, 0).hook.unwrap();
        assert!(!hook.complete(Outcome::from_status(401), 10));
        assert_eq!(count_of(&evaluator, &policy, "a"), Some(1));
    }

    #[test]
    fn test_stale_hook_does_not_touch_new_window() {
        let evaluator = evaluator();
        let policy = Policy::new("auth", Duration::from_millis(1000), 3).skip_successful_requests(true);

        let stale = evaluator.evaluate(&policy, "a", 3, 0).hook.unwrap();
        let _fresh = evaluator.evaluate(&policy, "a", 3, 2000).hook.unwrap();

        assert!(!stale.complete(Outcome::Success, 2001));
        assert_eq!(count_of(&evaluator, &policy, "a"), Some(1));
    }

    #[test]
    fn test_outcome_from_status() {
        assert_eq!(Outcome::from_status(200), Outcome::Success);
        assert_eq!(Outcome::from_status(204), Outcome::Success);
        assert_eq!(Outcome::from_status(302), Outcome::Failure);
        assert_eq!(Outcome::from_status(500), Outcome::Failure);
    }

    #[test]
    fn test_decision_wire_format() {
        let decision = Decision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at_epoch_secs: 1_700_000_000,
            retry_after_secs: 12,
        };
        let json = serde_json::to_value(decision).unwrap();
        assert_eq!(json["resetAtEpochSecs"], 1_700_000_000);
        assert_eq!(json["retryAfterSecs"], 12);
    }
}
