//! Reconnect policy and backoff schedule.
//!
//! The reconnect controller walks every configured endpoint once per attempt. The first
//! `max_conn_tries` attempts run back to back; later attempts are preceded by an
//! exponentially growing sleep capped at `max_sleep`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

// Reconnect settings

/// Default number of backoff rounds after the immediate ones
pub const DEFAULT_RECONNECT_TRIES: u32 = 5;

/// Default first backoff sleep in seconds
pub const DEFAULT_RECONNECT_SLEEP_SECS: u64 = 4;

/// Default cap for the backoff sleep in seconds
pub const DEFAULT_RECONNECT_MAX_SLEEP_SECS: u64 = 64;

/// Default number of attempts made without sleeping
pub const DEFAULT_RECONNECT_MAX_CONN_TRIES: u32 = 2;

/// Failure policy applied when no endpoint answers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectMode {
    /// Retry with backoff for every operation
    #[default]
    HardOpen,
    /// Retry with backoff; kept distinct for configuration compatibility
    HardInit,
    /// Fail after the first unsuccessful round
    Soft,
}

/// Retry budget for reaching a directory server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ReconnectPolicy {
    /// Hard or soft failure handling
    #[serde(default)]
    pub mode: ReconnectMode,

    /// Attempts preceded by a backoff sleep
    #[validate(range(min = 0, max = 100))]
    #[serde(default = "default_tries")]
    pub tries: u32,

    /// First backoff sleep in seconds
    #[validate(range(min = 0, max = 3600))]
    #[serde(default = "default_sleep_secs")]
    pub sleep_secs: u64,

    /// Maximum backoff sleep in seconds
    #[validate(range(min = 0, max = 3600))]
    #[serde(default = "default_max_sleep_secs")]
    pub max_sleep_secs: u64,

    /// Attempts made immediately, without sleeping
    #[validate(range(min = 1, max = 100))]
    #[serde(default = "default_max_conn_tries")]
    pub max_conn_tries: u32,
}

const fn default_tries() -> u32 {
    DEFAULT_RECONNECT_TRIES
}

const fn default_sleep_secs() -> u64 {
    DEFAULT_RECONNECT_SLEEP_SECS
}

const fn default_max_sleep_secs() -> u64 {
    DEFAULT_RECONNECT_MAX_SLEEP_SECS
}

const fn default_max_conn_tries() -> u32 {
    DEFAULT_RECONNECT_MAX_CONN_TRIES
}

impl ReconnectPolicy {
    /// Create a hard policy with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mode: ReconnectMode::HardOpen,
            tries: DEFAULT_RECONNECT_TRIES,
            sleep_secs: DEFAULT_RECONNECT_SLEEP_SECS,
            max_sleep_secs: DEFAULT_RECONNECT_MAX_SLEEP_SECS,
            max_conn_tries: DEFAULT_RECONNECT_MAX_CONN_TRIES,
        }
    }

    /// Create a policy that gives up after one round.
    #[must_use]
    pub const fn soft() -> Self {
        Self::new().with_mode(ReconnectMode::Soft)
    }

    /// Set the failure mode.
    #[must_use]
    pub const fn with_mode(mut self, mode: ReconnectMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the number of backoff attempts.
    #[must_use]
    pub const fn with_tries(mut self, tries: u32) -> Self {
        self.tries = tries;
        self
    }

    /// Set the first backoff sleep.
    #[must_use]
    pub const fn with_sleep_secs(mut self, seconds: u64) -> Self {
        self.sleep_secs = seconds;
        self
    }

    /// Set the backoff cap.
    #[must_use]
    pub const fn with_max_sleep_secs(mut self, seconds: u64) -> Self {
        self.max_sleep_secs = seconds;
        self
    }

    /// Set the number of immediate attempts.
    #[must_use]
    pub const fn with_max_conn_tries(mut self, tries: u32) -> Self {
        self.max_conn_tries = tries;
        self
    }

    /// Returns true unless the policy is soft.
    #[must_use]
    pub const fn is_hard(&self) -> bool {
        !matches!(self.mode, ReconnectMode::Soft)
    }

    /// Upper bound on attempts for one operation.
    #[must_use]
    pub const fn total_attempts(&self) -> u32 {
        self.tries.saturating_add(self.max_conn_tries)
    }

    /// Sleep required before the zero-based `attempt`, if any.
    ///
    /// Uses exponential backoff: delay = min(sleep * 2^(attempt - max_conn_tries), max_sleep)
    #[must_use]
    pub fn delay_before_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt < self.max_conn_tries {
            return None;
        }

        let exponent = attempt - self.max_conn_tries;
        let multiplier = 2u64.saturating_pow(exponent);
        let secs = self.sleep_secs.saturating_mul(multiplier);
        Some(Duration::from_secs(secs.min(self.max_sleep_secs)))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_constants() {
        assert_eq!(DEFAULT_RECONNECT_TRIES, 5);
        assert_eq!(DEFAULT_RECONNECT_SLEEP_SECS, 4);
        assert_eq!(DEFAULT_RECONNECT_MAX_SLEEP_SECS, 64);
        assert_eq!(DEFAULT_RECONNECT_MAX_CONN_TRIES, 2);
    }

    #[test]
    fn test_policy_new() {
        let policy = ReconnectPolicy::new();
        assert!(policy.is_hard());
        assert_eq!(policy.total_attempts(), 7);
        assert_eq!(policy, ReconnectPolicy::default());
    }

    #[test]
    fn test_soft_policy() {
        let policy = ReconnectPolicy::soft();
        assert!(!policy.is_hard());
        assert!(ReconnectPolicy::new()
            .with_mode(ReconnectMode::HardInit)
            .is_hard());
    }

    #[test]
    fn test_no_sleep_during_immediate_attempts() {
        let policy = ReconnectPolicy::new();
        assert_eq!(policy.delay_before_attempt(0), None);
        assert_eq!(policy.delay_before_attempt(1), None);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::new();

        assert_eq!(policy.delay_before_attempt(2), Some(Duration::from_secs(4)));
        assert_eq!(policy.delay_before_attempt(3), Some(Duration::from_secs(8)));
        assert_eq!(policy.delay_before_attempt(4), Some(Duration::from_secs(16)));
        assert_eq!(policy.delay_before_attempt(5), Some(Duration::from_secs(32)));
        assert_eq!(policy.delay_before_attempt(6), Some(Duration::from_secs(64)));

        // Capped at max_sleep
        assert_eq!(policy.delay_before_attempt(7), Some(Duration::from_secs(64)));
        assert_eq!(
            policy.delay_before_attempt(60),
            Some(Duration::from_secs(64))
        );
    }

    #[test]
    fn test_builder() {
        let policy = ReconnectPolicy::new()
            .with_tries(1)
            .with_sleep_secs(1)
            .with_max_sleep_secs(3)
            .with_max_conn_tries(3);

        assert_eq!(policy.total_attempts(), 4);
        assert_eq!(policy.delay_before_attempt(2), None);
        assert_eq!(policy.delay_before_attempt(3), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_before_attempt(5), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_serde_defaults() {
        let policy: ReconnectPolicy = serde_json::from_str(r#"{"mode":"soft"}"#).unwrap();
        assert_eq!(policy, ReconnectPolicy::soft());
    }

    #[test]
    fn test_validation() {
        let invalid = ReconnectPolicy::new().with_max_conn_tries(0);
        assert!(invalid.validate().is_err());
        assert!(ReconnectPolicy::new().validate().is_ok());
    }
}
