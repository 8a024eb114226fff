//! Graduated slow-down ahead of the hard limit.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::extract::{KeyExtractor, KeyStrategy};
use super::record::duration_millis;
use super::store::WindowStore;
use crate::error::{FloodgateError, Result};

/// Adds latency to callers that keep going past `delay_after` requests in a
/// window. Never rejects.
///
/// Counts in its own namespace (`speed:<name>`) of the shared store, so it
/// runs alongside the hard-limit policies without touching their counters.
#[derive(Debug, Clone)]
pub struct SpeedLimiter {
    name: String,
    id: Arc<str>,
    window: Duration,
    delay_after: u64,
    delay: Duration,
    max_delay: Option<Duration>,
    key: Arc<dyn KeyExtractor>,
    paths: Vec<String>,
}

impl SpeedLimiter {
    /// Delay each request past `delay_after` by `delay` times its overshoot.
    pub fn new(name: &str, window: Duration, delay_after: u64, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            id: Arc::from(format!("speed:{name}")),
            window,
            delay_after,
            delay,
            max_delay: None,
            key: Arc::new(KeyStrategy::ClientAddress),
            paths: Vec::new(),
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
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

    pub fn with_paths<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = prefixes.into_iter().map(Into::into).collect();
        self
    }

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
        if self.delay.is_zero() {
            return Err(FloodgateError::invalid_policy(
                &self.name,
                "delay must be greater than zero",
            ));
        }
        if self.max_delay.is_some_and(|max| max < self.delay) {
            return Err(FloodgateError::invalid_policy(
                &self.name,
                "max delay must not be shorter than the base delay",
            ));
        }
        Ok(())
    }

    /// Delay owed by the `count`-th request of a window.
    pub fn delay_for_count(&self, count: u64) -> Duration {
        let overshoot = count.saturating_sub(self.delay_after);
        if overshoot == 0 {
            return Duration::ZERO;
        }
        let factor = u32::try_from(overshoot).unwrap_or(u32::MAX);
        let delay = self.delay.saturating_mul(factor);
        match self.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    /// Count one request for `key` and return how long it should wait.
    ///
    /// Only the counting happens under the store's lock; the caller does the
    /// waiting.
    pub fn register_hit(&self, store: &WindowStore, key: &str, now: u64) -> Duration {
        let count = store.with_record(&self.id, key, self.window, now, |record| {
            record.roll_if_expired(now, self.window);
            record.increment()
        });
        let delay = self.delay_for_count(count);
        if !delay.is_zero() {
            trace!(
                limiter = %self.name,
                key = %key,
                count,
                delay_ms = duration_millis(delay),
                "Slowing down request"
            );
        }
        delay
    }

    pub fn applies_to(&self, path: &str) -> bool {
        self.paths.is_empty() || self.paths.iter().any(|p| path.starts_with(p.as_str()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn extractor(&self) -> &dyn KeyExtractor {
        self.key.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> SpeedLimiter {
        SpeedLimiter::new("global", Duration::from_secs(60), 3, Duration::from_millis(100))
    }

    #[test]
    fn test_no_delay_until_threshold() {
        let limiter = limiter();
        assert_eq!(limiter.delay_for_count(1), Duration::ZERO);
        assert_eq!(limiter.delay_for_count(3), Duration::ZERO);
    }

    #[test]
    fn test_delay_grows_linearly() {
        let limiter = limiter();
        assert_eq!(limiter.delay_for_count(4), Duration::from_millis(100));
        assert_eq!(limiter.delay_for_count(6), Duration::from_millis(300));
    }

    #[test]
    fn test_delay_is_capped() {
        let limiter = limiter().with_max_delay(Duration::from_millis(250));
        assert_eq!(limiter.delay_for_count(5), Duration::from_millis(200));
        assert_eq!(limiter.delay_for_count(50), Duration::from_millis(250));
    }

    #[test]
    fn test_register_hit_counts_per_window() {
        let store = WindowStore::new();
        let limiter = limiter();

        let delays: Vec<_> = (0..5).map(|_| limiter.register_hit(&store, "a", 0)).collect();
        assert_eq!(delays[2], Duration::ZERO);
        assert_eq!(delays[3], Duration::from_millis(100));
        assert_eq!(delays[4], Duration::from_millis(200));

        // New window, back to free requests.
        assert_eq!(limiter.register_hit(&store, "a", 60_001), Duration::ZERO);
    }

    #[test]
    fn test_uses_own_namespace() {
        let store = WindowStore::new();
        let limiter = limiter();
        limiter.register_hit(&store, "a", 0);

        let policy: Arc<str> = Arc::from("global");
        assert!(store.snapshot(&policy, "a").is_none());
        assert_eq!(store.snapshot(limiter.id(), "a").unwrap().count, 1);
    }

    #[test]
    fn test_validation() {
        assert!(limiter().validate().is_ok());
        assert!(SpeedLimiter::new("x", Duration::ZERO, 1, Duration::from_millis(1))
            .validate()
            .is_err());
        assert!(SpeedLimiter::new("x", Duration::from_secs(1), 1, Duration::ZERO)
            .validate()
            .is_err());
        assert!(limiter()
            .with_max_delay(Duration::from_millis(10))
            .validate()
            .is_err());
    }
}
