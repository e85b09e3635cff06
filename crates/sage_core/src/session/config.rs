//! Session lifetime policy.

use std::time::Duration;

use crate::error::ProtocolError;

/// Lifetime and housekeeping knobs for all sessions under one manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Hard cap on session age, measured from creation.
    pub max_age: Duration,
    /// A session with no traffic for this long expires.
    pub idle_timeout: Duration,
    /// Maximum successful AEAD operations before the session expires.
    pub max_messages: u64,
    /// Background GC cadence.
    pub gc_interval: Duration,
    /// Replay-cache TTL for request nonces. Must cover at least the
    /// `Date`-header freshness window.
    pub replay_ttl: Duration,
    /// How stale a request `Date` header may be.
    pub date_freshness: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(60 * 60),
            idle_timeout: Duration::from_secs(10 * 60),
            max_messages: 10_000,
            gc_interval: Duration::from_secs(30),
            replay_ttl: Duration::from_secs(10 * 60),
            date_freshness: Duration::from_secs(5 * 60),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.max_age.is_zero() {
            return Err(ProtocolError::ConfigurationError("max_age must be non-zero".into()));
        }
        if self.idle_timeout.is_zero() {
            return Err(ProtocolError::ConfigurationError(
                "idle_timeout must be non-zero".into(),
            ));
        }
        if self.max_messages == 0 {
            return Err(ProtocolError::ConfigurationError(
                "max_messages must be non-zero".into(),
            ));
        }
        if self.gc_interval.is_zero() {
            return Err(ProtocolError::ConfigurationError(
                "gc_interval must be non-zero".into(),
            ));
        }
        if self.replay_ttl < self.date_freshness {
            return Err(ProtocolError::ConfigurationError(
                "replay_ttl must cover the Date freshness window".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        SessionConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_replay_ttl_below_freshness_window() {
        let config = SessionConfig {
            replay_ttl: Duration::from_secs(10),
            date_freshness: Duration::from_secs(60),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_lifetimes() {
        for field in 0..3 {
            let mut config = SessionConfig::default();
            match field {
                0 => config.max_age = Duration::ZERO,
                1 => config.idle_timeout = Duration::ZERO,
                _ => config.max_messages = 0,
            }
            assert!(config.validate().is_err());
        }
    }
}
