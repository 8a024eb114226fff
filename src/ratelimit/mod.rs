//! Rate limiting logic and state management.

mod extract;
mod janitor;
mod key;
mod limiter;
mod policy;
pub mod presets;
mod record;
mod registry;
mod rules;
mod speed;
mod store;

pub use extract::{
    from_fn, FnExtractor, Identity, KeyError, KeyExtractor, KeyStrategy, RequestContext, Role,
};
pub use janitor::{Janitor, DEFAULT_SWEEP_INTERVAL};
pub use key::RecordKey;
pub use limiter::{CompletionHook, Decision, Evaluation, Outcome, PolicyEvaluator};
pub use policy::{Limit, Policy, RoleLimits, DEFAULT_MESSAGE, DEFAULT_STATUS_CODE};
pub use record::RateLimitRecord;
pub use registry::{Admission, Completion, EnforcementMode, PolicyRegistry, Rejection};
pub use rules::{PolicyRule, RulesConfig, SpeedLimitRule};
pub use speed::SpeedLimiter;
pub use store::WindowStore;
