//! Store key generation and handling.

use std::sync::Arc;

/// A key that uniquely identifies a rate limit record.
///
/// The key is composed of the owning policy's id and the caller key the
/// policy's extractor produced.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    /// The policy (or speed limiter) this record belongs to
    pub policy: Arc<str>,
    /// Caller identity as produced by the key extractor
    pub key: String,
}

impl RecordKey {
    /// Create a new record key.
    pub fn new(policy: &Arc<str>, key: &str) -> Self {
        Self {
            policy: Arc::clone(policy),
            key: key.to_string(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.policy, self.key)
    }
}
