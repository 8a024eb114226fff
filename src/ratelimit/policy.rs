//! Named admission policies.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::extract::{KeyExtractor, KeyStrategy, RequestContext, Role};
use crate::error::{FloodgateError, Result};

/// Status code used for rejections unless a policy overrides it.
pub const DEFAULT_STATUS_CODE: u16 = 429;
/// Message used for rejections unless a policy overrides it.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Per-role request thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleLimits {
    #[serde(default = "default_anonymous")]
    pub anonymous: u64,
    #[serde(default = "default_basic")]
    pub basic: u64,
    #[serde(default = "default_premium")]
    pub premium: u64,
    #[serde(default = "default_admin")]
    pub admin: u64,
}

fn default_anonymous() -> u64 {
    50
}

fn default_basic() -> u64 {
    100
}

fn default_premium() -> u64 {
    500
}

fn default_admin() -> u64 {
    1000
}

impl Default for RoleLimits {
    fn default() -> Self {
        Self {
            anonymous: default_anonymous(),
            basic: default_basic(),
            premium: default_premium(),
            admin: default_admin(),
        }
    }
}

impl RoleLimits {
    pub fn limit_for(&self, role: Role) -> u64 {
        match role {
            Role::Anonymous => self.anonymous,
            Role::Basic => self.basic,
            Role::Premium => self.premium,
            Role::Admin => self.admin,
        }
    }
}

type LimitFn = dyn Fn(&RequestContext) -> u64 + Send + Sync;

/// Where a policy's `max_requests` comes from.
///
/// Resolved on every request and never stored on the record, so a caller
/// whose role changes sees the new threshold on their next request.
#[derive(Clone)]
pub enum Limit {
    /// The same threshold for every caller
    Fixed(u64),
    /// Threshold looked up from the caller's role
    ByRole(RoleLimits),
    /// Arbitrary pure function of the request
    Dynamic(Arc<LimitFn>),
}

impl Limit {
    /// Wrap a closure as a dynamic limit.
    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(&RequestContext) -> u64 + Send + Sync + 'static,
    {
        Limit::Dynamic(Arc::new(f))
    }

    pub fn resolve(&self, ctx: &RequestContext) -> u64 {
        match self {
            Limit::Fixed(max) => *max,
            Limit::ByRole(limits) => limits.limit_for(ctx.role()),
            Limit::Dynamic(f) => f(ctx),
        }
    }
}

impl fmt::Debug for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Fixed(max) => f.debug_tuple("Fixed").field(max).finish(),
            Limit::ByRole(limits) => f.debug_tuple("ByRole").field(limits).finish(),
            Limit::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// A named, independently configured rate limit.
#[derive(Debug, Clone)]
pub struct Policy {
    name: Arc<str>,
    window: Duration,
    limit: Limit,
    key: Arc<dyn KeyExtractor>,
    skip_successful_requests: bool,
    message: String,
    status_code: u16,
    paths: Vec<String>,
}

impl Policy {
    /// Create a policy counting per client address with a fixed threshold.
    pub fn new(name: &str, window: Duration, max_requests: u64) -> Self {
        Self {
            name: Arc::from(name),
            window,
            limit: Limit::Fixed(max_requests),
            key: Arc::new(KeyStrategy::ClientAddress),
            skip_successful_requests: false,
            message: DEFAULT_MESSAGE.to_string(),
            status_code: DEFAULT_STATUS_CODE,
            paths: Vec::new(),
        }
    }

    pub fn with_limit(mut self, limit: Limit) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_key(mut self, strategy: KeyStrategy) -> Self {
        self.key = Arc::new(strategy);
        self
    }

    pub fn with_extractor(mut self, extractor: impl KeyExtractor + 'static) -> Self {
        self.key = Arc::new(extractor);
        self
    }

    /// Only count requests whose downstream outcome is not a success.
    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_status_code(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }

    /// Restrict the policy to request paths starting with any of `prefixes`.
    pub fn with_paths<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = prefixes.into_iter().map(Into::into).collect();
        self
    }

    /// Reject configurations that could never behave sensibly.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(FloodgateError::invalid_policy(&self.name, "name must not be empty"));
        }
        if self.window.as_millis() == 0 {
            return Err(FloodgateError::invalid_policy(
                &self.name,
                "window must be at least one millisecond",
            ));
        }
        match &self.limit {
            Limit::Fixed(0) => {
                return Err(FloodgateError::invalid_policy(
                    &self.name,
                    "max_requests must be greater than zero",
                ));
            }
            Limit::ByRole(limits) => {
                let roles = [Role::Anonymous, Role::Basic, Role::Premium, Role::Admin];
                if let Some(role) = roles.into_iter().find(|r| limits.limit_for(*r) == 0) {
                    return Err(FloodgateError::invalid_policy(
                        &self.name,
                        format!("limit for role '{role}' must be greater than zero"),
                    ));
                }
            }
            _ => {}
        }
        if !(400..=599).contains(&self.status_code) {
            return Err(FloodgateError::invalid_policy(
                &self.name,
                format!("status code {} is not a 4xx/5xx code", self.status_code),
            ));
        }
        Ok(())
    }

    /// Whether this policy should see a request for `path`.
    pub fn applies_to(&self, path: &str) -> bool {
        self.paths.is_empty() || self.paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store namespace for this policy's records.
    pub(crate) fn id(&self) -> &Arc<str> {
        &self.name
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn limit(&self) -> &Limit {
        &self.limit
    }

    pub fn extractor(&self) -> &dyn KeyExtractor {
        self.key.as_ref()
    }

    pub fn skips_successful_requests(&self) -> bool {
        self.skip_successful_requests
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }
}
