//! Built-in policies registered when no rules file is given.

use std::time::Duration;

use super::extract::KeyStrategy;
use super::policy::{Limit, Policy, RoleLimits};
use super::registry::PolicyRegistry;
use super::speed::SpeedLimiter;
use crate::error::Result;

const FIFTEEN_MINUTES: Duration = Duration::from_secs(15 * 60);
const ONE_HOUR: Duration = Duration::from_secs(60 * 60);

/// 100 requests per client address per 15 minutes on the API.
pub fn global() -> Policy {
    Policy::new("global", FIFTEEN_MINUTES, 100)
        .with_paths(["/api/"])
        .with_message("Too many requests from this IP, please try again later")
}

/// 5 failed authentication attempts per client address per 15 minutes.
pub fn auth_strict() -> Policy {
    Policy::new("auth", FIFTEEN_MINUTES, 5)
        .with_paths(["/api/auth/"])
        .skip_successful_requests(true)
        .with_message("Too many authentication attempts, please try again later")
}

/// 1000 requests per API key per hour on the programmatic API.
pub fn api_key() -> Policy {
    Policy::new("api_key", ONE_HOUR, 1000)
        .with_key(KeyStrategy::Header {
            name: "x-api-key".to_string(),
        })
        .with_paths(["/api/v1/"])
        .with_message("API key request quota exceeded")
}

/// Per-user limits that scale with the caller's role.
pub fn role_based() -> Policy {
    Policy::new("role", FIFTEEN_MINUTES, 1)
        .with_limit(Limit::ByRole(RoleLimits::default()))
        .with_key(KeyStrategy::Role)
        .with_paths(["/api/"])
}

/// Slow callers down after 50 requests in 15 minutes, up to 2 s per request.
pub fn global_speed_limit() -> SpeedLimiter {
    SpeedLimiter::new("global", FIFTEEN_MINUTES, 50, Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .with_paths(["/api/"])
}

/// Register every preset with `registry`.
pub fn install(registry: &PolicyRegistry) -> Result<()> {
    registry.register_speed_limiter(global_speed_limit())?;
    for policy in [global(), auth_strict(), api_key(), role_based()] {
        registry.register(policy)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::store::WindowStore;
    use std::sync::Arc;

    #[test]
    fn test_presets_are_valid() {
        for policy in [global(), auth_strict(), api_key(), role_based()] {
            assert!(policy.validate().is_ok(), "{} should be valid", policy.name());
        }
        assert!(global_speed_limit().validate().is_ok());
    }

    #[test]
    fn test_install() {
        let registry =
            PolicyRegistry::new(Arc::new(WindowStore::new()), Arc::new(ManualClock::new(0)));
        install(&registry).unwrap();
        assert_eq!(registry.policy_names(), vec!["global", "auth", "api_key", "role"]);
    }
}
