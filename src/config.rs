//! Cache configuration.

use std::fmt;

use crate::error::{CacheError, CacheResult};
use crate::identity::{FragmentMatcher, IdentityPolicy};

/// Configuration shared by the normalizer, the reader and the cache facade.
#[derive(Clone)]
pub struct CacheConfig {
    /// Reject results missing a selected field (`true`) or skip the field (`false`).
    pub strict_writes: bool,
    /// How nested objects get their entity keys.
    pub identity: IdentityPolicy,
    /// Decides type-conditional fragments. `None` includes them optimistically.
    pub fragment_matcher: Option<FragmentMatcher>,
    /// Per-subscriber event channel bound. `None` means unbounded.
    pub event_capacity: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strict_writes: true,
            identity: IdentityPolicy::default(),
            fragment_matcher: None,
            event_capacity: None,
        }
    }
}

impl fmt::Debug for CacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheConfig")
            .field("strict_writes", &self.strict_writes)
            .field("identity", &self.identity)
            .field("fragment_matcher", &self.fragment_matcher.is_some())
            .field("event_capacity", &self.event_capacity)
            .finish()
    }
}

impl CacheConfig {
    /// Fail writes whose result lacks a selected field.
    #[must_use]
    pub fn with_strict_writes(mut self, strict: bool) -> Self {
        self.strict_writes = strict;
        self
    }

    /// Sets how records are keyed.
    #[must_use]
    pub fn with_identity(mut self, identity: IdentityPolicy) -> Self {
        self.identity = identity;
        self
    }

    /// Sets how fragment type conditions are matched.
    #[must_use]
    pub fn with_fragment_matcher(mut self, matcher: FragmentMatcher) -> Self {
        self.fragment_matcher = Some(matcher);
        self
    }

    /// Buffer size of each subscriber channel.
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Validate the configuration.
    ///
    /// This must be called before constructing an `InMemoryCache`.
    pub fn validate(&self) -> CacheResult<()> {
        if self.event_capacity == Some(0) {
            return Err(CacheError::InvalidConfig {
                reason: "event_capacity must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default_is_valid() {
        let c = CacheConfig::default();
        c.validate().unwrap();
        assert!(c.strict_writes);
        assert!(c.fragment_matcher.is_none());
    }

    #[test]
    fn config_rejects_zero_capacity() {
        let c = CacheConfig::default().with_event_capacity(0);
        assert!(matches!(c.validate(), Err(CacheError::InvalidConfig { .. })));
        CacheConfig::default().with_event_capacity(8).validate().unwrap();
    }

    #[test]
    fn config_debug_hides_closures() {
        let c = CacheConfig::default().with_fragment_matcher(crate::identity::typename_matcher());
        let s = format!("{c:?}");
        assert!(s.contains("fragment_matcher: true"));
    }
}
