//! Configuration management for Floodgate.
//!
//! Settings come from an optional YAML file layered under `FLOODGATE__*`
//! environment variables, e.g. `FLOODGATE__RATE_LIMITING__MODE=observe`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Result;
use crate::ratelimit::{EnforcementMode, DEFAULT_SWEEP_INTERVAL};

/// Environment variable that switches enforcement off for local development.
///
/// `observe` keeps decisions running without enforcing them; any other truthy
/// value (`1`, `true`, `yes`, `on`) turns rate limiting off.
pub const KILL_SWITCH_ENV: &str = "FLOODGATE_DISABLE_RATE_LIMIT";

/// Main configuration for the Floodgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Path to the policy rules file; built-in presets are used when unset
    pub rules_path: Option<String>,

    /// Whether decisions are enforced
    #[serde(default)]
    pub mode: EnforcementMode,

    /// Interval between janitor sweeps in seconds
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            rules_path: None,
            mode: EnforcementMode::default(),
            janitor_interval_secs: default_janitor_interval(),
        }
    }
}

fn default_janitor_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL.as_secs()
}

impl RateLimitingConfig {
    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }
}

fn env_source() -> config::Environment {
    config::Environment::with_prefix("FLOODGATE")
        .prefix_separator("__")
        .separator("__")
}

impl FloodgateConfig {
    /// Load configuration from an optional file path plus the environment.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }
        let config: FloodgateConfig = builder.add_source(env_source()).build()?.try_deserialize()?;
        Ok(config)
    }

    /// Load configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Apply the kill switch value, if one is set.
    pub fn apply_kill_switch(&mut self, value: Option<&str>) {
        if let Some(mode) = value.and_then(kill_switch_mode) {
            self.rate_limiting.mode = mode;
        }
    }
}

/// Interpret a kill switch value. Returns `None` when the switch is not engaged.
pub fn kill_switch_mode(value: &str) -> Option<EnforcementMode> {
    match value.trim().to_ascii_lowercase().as_str() {
        "observe" => Some(EnforcementMode::Observe),
        "1" | "true" | "yes" | "on" | "off" => Some(EnforcementMode::Off),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = FloodgateConfig::default();
        assert_eq!(config.server.listen_addr.port(), 8080);
        assert_eq!(config.rate_limiting.mode, EnforcementMode::Enforce);
        assert_eq!(config.rate_limiting.janitor_interval(), Duration::from_secs(60));
        assert!(config.rate_limiting.rules_path.is_none());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
server:
  listen_addr: "0.0.0.0:9000"
rate_limiting:
  rules_path: /etc/floodgate/rules.yaml
  mode: observe
  janitor_interval_secs: 30
"#;
        let config = FloodgateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.listen_addr.port(), 9000);
        assert_eq!(config.rate_limiting.mode, EnforcementMode::Observe);
        assert_eq!(config.rate_limiting.janitor_interval_secs, 30);
        assert_eq!(
            config.rate_limiting.rules_path.as_deref(),
            Some("/etc/floodgate/rules.yaml")
        );
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = FloodgateConfig::from_yaml("rate_limiting:\n  mode: off\n").unwrap();
        assert_eq!(config.rate_limiting.mode, EnforcementMode::Off);
        assert_eq!(config.server.listen_addr.port(), 8080);
    }

    #[test]
    fn test_kill_switch_values() {
        assert_eq!(kill_switch_mode("observe"), Some(EnforcementMode::Observe));
        assert_eq!(kill_switch_mode("TRUE"), Some(EnforcementMode::Off));
        assert_eq!(kill_switch_mode("1"), Some(EnforcementMode::Off));
        assert_eq!(kill_switch_mode("0"), None);
        assert_eq!(kill_switch_mode(""), None);
    }

    #[test]
    fn test_apply_kill_switch() {
        let mut config = FloodgateConfig::default();
        config.apply_kill_switch(None);
        assert_eq!(config.rate_limiting.mode, EnforcementMode::Enforce);

        config.apply_kill_switch(Some("observe"));
        assert_eq!(config.rate_limiting.mode, EnforcementMode::Observe);
    }
}
