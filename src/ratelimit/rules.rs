//! Policy and speed limit rules loaded from configuration.
//!
//! Rules are a YAML document listing policies and speed limiters in the order
//! they should run:
//!
//! ```yaml
//! policies:
//!   - name: global
//!     window_ms: 900000
//!     max_requests: 100
//!     paths: ["/api/"]
//!   - name: roles
//!     window_ms: 900000
//!     role_limits: { anonymous: 50, basic: 100, premium: 500, admin: 1000 }
//!     key: { strategy: role }
//! speed_limits:
//!   - name: global
//!     window_ms: 900000
//!     delay_after: 50
//!     delay_ms: 100
//!     max_delay_ms: 2000
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use super::extract::KeyStrategy;
use super::policy::{Limit, Policy, RoleLimits, DEFAULT_MESSAGE, DEFAULT_STATUS_CODE};
use super::registry::PolicyRegistry;
use super::speed::SpeedLimiter;
use crate::error::{FloodgateError, Result};

/// A complete rules document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Hard-limit policies, in evaluation order
    #[serde(default)]
    pub policies: Vec<PolicyRule>,
    /// Slow-down stages, run before the policies
    #[serde(default)]
    pub speed_limits: Vec<SpeedLimitRule>,
}

/// Configuration for one policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Fixed threshold; mutually exclusive with `role_limits`
    #[serde(default)]
    pub max_requests: Option<u64>,
    /// Per-role thresholds; mutually exclusive with `max_requests`
    #[serde(default)]
    pub role_limits: Option<RoleLimits>,
    #[serde(default)]
    pub key: KeyStrategy,
    /// Path prefixes this policy covers; empty covers everything
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub skip_successful_requests: bool,
    #[serde(default = "default_message")]
    pub message: String,
    #[serde(default = "default_status_code")]
    pub status_code: u16,
}

/// Configuration for one speed limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedLimitRule {
    pub name: String,
    pub window_ms: u64,
    pub delay_after: u64,
    pub delay_ms: u64,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
    #[serde(default)]
    pub key: KeyStrategy,
    #[serde(default)]
    pub paths: Vec<String>,
}

fn default_message() -> String {
    DEFAULT_MESSAGE.to_string()
}

fn default_status_code() -> u16 {
    DEFAULT_STATUS_CODE
}

impl PolicyRule {
    /// Build the policy this rule describes. Validation happens on registration.
    pub fn to_policy(&self) -> Result<Policy> {
        let limit = match (self.max_requests, self.role_limits) {
            (Some(max), None) => Limit::Fixed(max),
            (None, Some(roles)) => Limit::ByRole(roles),
            (Some(_), Some(_)) => {
                return Err(FloodgateError::invalid_policy(
                    &self.name,
                    "set either max_requests or role_limits, not both",
                ));
            }
            (None, None) => {
                return Err(FloodgateError::invalid_policy(
                    &self.name,
                    "one of max_requests or role_limits is required",
                ));
            }
        };

        Ok(Policy::new(&self.name, Duration::from_millis(self.window_ms), 1)
            .with_limit(limit)
            .with_key(self.key.clone())
            .with_paths(self.paths.iter().cloned())
            .skip_successful_requests(self.skip_successful_requests)
            .with_message(self.message.clone())
            .with_status_code(self.status_code))
    }
}

impl SpeedLimitRule {
    pub fn to_speed_limiter(&self) -> SpeedLimiter {
        let limiter = SpeedLimiter::new(
            &self.name,
            Duration::from_millis(self.window_ms),
            self.delay_after,
            Duration::from_millis(self.delay_ms),
        )
        .with_key(self.key.clone())
        .with_paths(self.paths.iter().cloned());

        match self.max_delay_ms {
            Some(max) => limiter.with_max_delay(Duration::from_millis(max)),
            None => limiter,
        }
    }
}

impl RulesConfig {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse rate limit rules: {}", e)))
    }

    /// Register every rule with `registry`, speed limiters first.
    ///
    /// Stops at the first invalid rule.
    pub fn install(&self, registry: &PolicyRegistry) -> Result<()> {
        for rule in &self.speed_limits {
            registry.register_speed_limiter(rule.to_speed_limiter())?;
        }
        for rule in &self.policies {
            registry.register(rule.to_policy()?)?;
        }
        Ok(())
    }
}
