//! Registry of named policies and the per-request admission pipeline.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::extract::{KeyError, KeyExtractor, RequestContext};
use super::janitor::Janitor;
use super::limiter::{CompletionHook, Decision, Evaluation, Outcome, PolicyEvaluator};
use super::policy::Policy;
use super::record::duration_millis;
use super::speed::SpeedLimiter;
use super::store::WindowStore;
use crate::clock::{Clock, SystemClock};
use crate::error::{FloodgateError, Result};
use crate::sleeper::{Sleeper, TokioSleeper};

/// Whether decisions are enforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnforcementMode {
    /// Reject and delay as configured
    #[default]
    Enforce,
    /// Count and decide, log would-be rejections, but let everything through
    Observe,
    /// Skip rate limiting entirely
    Off,
}

/// Why a request was turned away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub policy: String,
    pub message: String,
    pub status_code: u16,
    pub decision: Decision,
}

/// Hooks the pipeline settles once the downstream outcome is known.
///
/// Must be completed exactly once per admitted request; dropping it without
/// completing (for example when the request is aborted) keeps every
/// optimistic increment in place.
#[derive(Debug)]
#[must_use = "a completion must be settled with the response status"]
pub struct Completion {
    hooks: Vec<CompletionHook>,
    clock: Arc<dyn Clock>,
}

impl Completion {
    /// Settle with the final response status.
    pub fn complete(self, status: u16) {
        let outcome = Outcome::from_status(status);
        let now = self.clock.now_millis();
        for hook in self.hooks {
            hook.complete(outcome, now);
        }
    }

    /// Whether completing this value can have any effect.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

/// Result of running a request through every applicable stage.
#[derive(Debug)]
pub struct Admission {
    /// Metadata to expose to the caller: the rejecting decision, or the most
    /// restrictive allowing one. `None` when no policy counted the request.
    pub decision: Option<Decision>,
    /// Set when the request must be short-circuited.
    pub rejection: Option<Rejection>,
    pub completion: Completion,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Ordered set of named policies and speed limiters over one shared store.
///
/// Policies run in registration order for every request whose path they
/// cover; the first rejection stops the chain.
#[derive(Debug)]
pub struct PolicyRegistry {
    evaluator: PolicyEvaluator,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    mode: EnforcementMode,
    policies: RwLock<Vec<Arc<Policy>>>,
    speed_limiters: RwLock<Vec<Arc<SpeedLimiter>>>,
    janitor: Mutex<Option<Janitor>>,
    extractor_faults: AtomicU64,
}

impl PolicyRegistry {
    /// Create an empty registry over `store`.
    pub fn new(store: Arc<WindowStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            evaluator: PolicyEvaluator::new(store),
            clock,
            sleeper: Arc::new(TokioSleeper),
            mode: EnforcementMode::Enforce,
            policies: RwLock::new(Vec::new()),
            speed_limiters: RwLock::new(Vec::new()),
            janitor: Mutex::new(None),
            extractor_faults: AtomicU64::new(0),
        }
    }

    /// Registry with its own store and the system clock.
    pub fn with_system_clock() -> Self {
        Self::new(Arc::new(WindowStore::new()), Arc::new(SystemClock::new()))
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_mode(mut self, mode: EnforcementMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> EnforcementMode {
        self.mode
    }

    pub fn store(&self) -> &Arc<WindowStore> {
        self.evaluator.store()
    }

    /// Validate and append a policy.
    pub fn register(&self, policy: Policy) -> Result<()> {
        policy.validate()?;

        // Both lists stay write-locked from the uniqueness check to the push.
        let mut policies = self.policies.write();
        let speed_limiters = self.speed_limiters.write();
        ensure_unique(&policies, &speed_limiters, policy.id())?;

        info!(
            policy = %policy.name(),
            window_ms = duration_millis(policy.window()),
            limit = ?policy.limit(),
            paths = ?policy.paths(),
            skip_successful = policy.skips_successful_requests(),
            "Registered rate limit policy"
        );
        policies.push(Arc::new(policy));
        Ok(())
    }

    /// Validate and append a speed limiter stage.
    pub fn register_speed_limiter(&self, limiter: SpeedLimiter) -> Result<()> {
        limiter.validate()?;

        let policies = self.policies.write();
        let mut speed_limiters = self.speed_limiters.write();
        ensure_unique(&policies, &speed_limiters, limiter.id())?;

        info!(limiter = %limiter.name(), "Registered speed limiter");
        speed_limiters.push(Arc::new(limiter));
        Ok(())
    }

    pub fn policy(&self, name: &str) -> Option<Arc<Policy>> {
        self.policies
            .read()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.policies
            .read()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Number of key extraction faults that were let through.
    pub fn extractor_faults(&self) -> u64 {
        self.extractor_faults.load(Ordering::Relaxed)
    }

    /// Number of records currently held in the store.
    pub fn record_count(&self) -> usize {
        self.store().len()
    }

    fn note_fault(&self, stage: &str, path: &str, error: &KeyError) {
        self.extractor_faults.fetch_add(1, Ordering::Relaxed);
        warn!(
            stage = %stage,
            path = %path,
            error = %error,
            "Key extraction failed, letting request through"
        );
    }

    fn extract_key(
        &self,
        stage: &str,
        extractor: &dyn KeyExtractor,
        ctx: &RequestContext,
    ) -> Option<String> {
        let extracted = catch_unwind(AssertUnwindSafe(|| extractor.extract(ctx)))
            .unwrap_or_else(|_| Err(KeyError::Failed("key extractor panicked".to_string())));
        match extracted {
            Ok(key) if !key.trim().is_empty() => Some(key),
            Ok(_) => {
                self.note_fault(stage, &ctx.path, &KeyError::Empty);
                None
            }
            Err(error) => {
                self.note_fault(stage, &ctx.path, &error);
                None
            }
        }
    }

    fn evaluate_policy(&self, policy: &Policy, ctx: &RequestContext, now: u64) -> Evaluation {
        let resolved = catch_unwind(AssertUnwindSafe(|| policy.limit().resolve(ctx)));
        let Ok(max_requests) = resolved else {
            self.note_fault(
                policy.name(),
                &ctx.path,
                &KeyError::Failed("limit resolver panicked".to_string()),
            );
            return Evaluation {
                decision: Decision::unmetered(0, policy, now),
                hook: None,
            };
        };
        if max_requests == 0 {
            warn!(
                policy = %policy.name(),
                "Resolved limit is zero, letting request through"
            );
            return Evaluation {
                decision: Decision::unmetered(0, policy, now),
                hook: None,
            };
        }

        match self.extract_key(policy.name(), policy.extractor(), ctx) {
            Some(key) => self.evaluator.evaluate(policy, &key, max_requests, now),
            None => Evaluation {
                decision: Decision::unmetered(max_requests, policy, now),
                hook: None,
            },
        }
    }

    /// Decide a request against one named policy.
    ///
    /// Returns `None` if no such policy is registered. Any completion hook is
    /// dropped, so the request stays counted.
    pub fn check(&self, name: &str, ctx: &RequestContext) -> Option<Decision> {
        let policy = self.policy(name)?;
        let now = self.clock.now_millis();
        Some(self.evaluate_policy(&policy, ctx, now).decision)
    }

    /// Run a request through every speed limiter and policy that covers its
    /// path.
    pub async fn admit(&self, ctx: &RequestContext) -> Admission {
        let mut completion = Completion {
            hooks: Vec::new(),
            clock: Arc::clone(&self.clock),
        };

        if self.mode == EnforcementMode::Off {
            return Admission {
                decision: None,
                rejection: None,
                completion,
            };
        }

        if self.mode == EnforcementMode::Enforce {
            self.slow_down(ctx).await;
        }

        let policies: Vec<Arc<Policy>> = self
            .policies
            .read()
            .iter()
            .filter(|p| p.applies_to(&ctx.path))
            .cloned()
            .collect();

        let now = self.clock.now_millis();
        let mut shown: Option<Decision> = None;

        for policy in policies {
            let Evaluation { decision, hook } = self.evaluate_policy(&policy, ctx, now);

            if !decision.allowed {
                if self.mode == EnforcementMode::Observe {
                    warn!(
                        policy = %policy.name(),
                        path = %ctx.path,
                        retry_after = decision.retry_after_secs,
                        "Would reject request (observe mode)"
                    );
                    shown = Some(decision);
                    continue;
                }

                debug!(policy = %policy.name(), path = %ctx.path, "Rejecting request");
                return Admission {
                    decision: Some(decision),
                    rejection: Some(Rejection {
                        policy: policy.name().to_string(),
                        message: policy.message().to_string(),
                        status_code: policy.status_code(),
                        decision,
                    }),
                    completion,
                };
            }

            if let Some(hook) = hook {
                completion.hooks.push(hook);
            }
            shown = match shown {
                Some(current) if current.remaining <= decision.remaining => Some(current),
                _ => Some(decision),
            };
        }

        Admission {
            decision: shown,
            rejection: None,
            completion,
        }
    }

    async fn slow_down(&self, ctx: &RequestContext) {
        let limiters: Vec<Arc<SpeedLimiter>> = self
            .speed_limiters
            .read()
            .iter()
            .filter(|s| s.applies_to(&ctx.path))
            .cloned()
            .collect();

        for limiter in limiters {
            let Some(key) = self.extract_key(limiter.name(), limiter.extractor(), ctx) else {
                continue;
            };
            let delay = limiter.register_hit(self.store(), &key, self.clock.now_millis());
            if !delay.is_zero() {
                self.sleeper.sleep(delay).await;
            }
        }
    }

    /// Start sweeping expired records every `interval`.
    ///
    /// Replaces (and aborts) any janitor started earlier.
    pub fn start_janitor(&self, interval: Duration) -> Result<()> {
        let janitor = Janitor::spawn(self.store(), Arc::clone(&self.clock), interval)?;
        *self.janitor.lock() = Some(janitor);
        Ok(())
    }

    pub fn janitor_running(&self) -> bool {
        self.janitor.lock().as_ref().is_some_and(Janitor::is_running)
    }

    /// Stop background work.
    pub async fn shutdown(&self) {
        let janitor = self.janitor.lock().take();
        if let Some(janitor) = janitor {
            janitor.shutdown().await;
            info!("Rate limit janitor stopped");
        }
    }
}

fn ensure_unique(
    policies: &[Arc<Policy>],
    speed_limiters: &[Arc<SpeedLimiter>],
    id: &str,
) -> Result<()> {
    let taken = policies.iter().any(|p| p.id().as_ref() == id)
        || speed_limiters.iter().any(|s| s.id().as_ref() == id);
    if taken {
        return Err(FloodgateError::DuplicatePolicy(id.to_string()));
    }
    Ok(())
}
