// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policy: bounded attempts with exponential backoff and jitter.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::SluiceError;

/// Predicate deciding whether a failed attempt is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&SluiceError) -> bool + Send + Sync>;

/// Retry configuration.
///
/// The default predicate retries transient-class categories only; install a
/// custom one with [`RetryConfig::with_retry_on`].
#[derive(Clone)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one. At least 1.
    pub max_attempts: u32,
    /// Backoff before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single backoff sleep.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each retry. At least 1.0.
    pub backoff_factor: f64,
    /// Add uniform jitter of up to 25% of the current delay.
    pub jitter: bool,
    retry_on: Option<RetryPredicate>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            jitter: true,
            retry_on: None,
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter", &self.jitter)
            .field(
                "retry_on",
                if self.retry_on.is_some() {
                    &"custom"
                } else {
                    &"default"
                },
            )
            .finish()
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Set the total attempt budget (clamped to at least 1).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the backoff before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the backoff ceiling.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier (clamped to at least 1.0).
    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = if factor < 1.0 { 1.0 } else { factor };
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Install a custom retry predicate.
    pub fn with_retry_on(
        mut self,
        predicate: impl Fn(&SluiceError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    /// Whether a failed attempt should be retried.
    pub fn should_retry(&self, err: &SluiceError) -> bool {
        match &self.retry_on {
            Some(predicate) => predicate(err),
            None => err.category().is_transient(),
        }
    }

    /// The actual sleep for the current delay: jittered and capped.
    pub fn wait_for(&self, delay: Duration) -> Duration {
        let jittered = if self.jitter && !delay.is_zero() {
            let extra = rand::rng().random_range(0.0..=delay.as_secs_f64() * 0.25);
            delay + Duration::from_secs_f64(extra)
        } else {
            delay
        };
        jittered.min(self.max_delay)
    }

    /// The delay to use after one more retry: scaled, rounded up to a whole
    /// millisecond, and capped.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let scaled_ms = (delay.as_secs_f64() * self.backoff_factor * 1000.0).ceil();
        Duration::from_millis(scaled_ms as u64).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(2));
        assert_eq!(config.backoff_factor, 2.0);
        assert!(config.jitter);
    }

    #[test]
    fn test_builder_clamps() {
        let config = RetryConfig::default()
            .with_max_attempts(0)
            .with_backoff_factor(0.5);
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.backoff_factor, 1.0);
    }

    #[test]
    fn test_default_predicate_follows_category() {
        let config = RetryConfig::default();
        let transient = SluiceError::new("slow", ErrorCategory::Timeout);
        let permanent = SluiceError::new("bad sql", ErrorCategory::Syntax);
        assert!(config.should_retry(&transient));
        assert!(!config.should_retry(&permanent));
    }

    #[test]
    fn test_custom_predicate_overrides() {
        let config = RetryConfig::default()
            .with_retry_on(|err| err.category() == ErrorCategory::Constraint);
        let constraint = SluiceError::new("dup key", ErrorCategory::Constraint);
        let timeout = SluiceError::new("slow", ErrorCategory::Timeout);
        assert!(config.should_retry(&constraint));
        assert!(!config.should_retry(&timeout));
    }

    #[test]
    fn test_next_delay_doubles_and_caps() {
        let config = RetryConfig::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .with_backoff_factor(2.0);

        let d1 = config.next_delay(Duration::from_millis(100));
        assert_eq!(d1, Duration::from_millis(200));
        let d2 = config.next_delay(d1);
        assert_eq!(d2, Duration::from_millis(350));
        let d3 = config.next_delay(d2);
        assert_eq!(d3, Duration::from_millis(350));
    }

    #[test]
    fn test_next_delay_rounds_up() {
        let config = RetryConfig::default().with_backoff_factor(1.5);
        assert_eq!(
            config.next_delay(Duration::from_millis(3)),
            Duration::from_millis(5)
        );
    }

    #[test]
    fn test_wait_without_jitter_is_exact() {
        let config = RetryConfig::default().with_jitter(false);
        assert_eq!(
            config.wait_for(Duration::from_millis(100)),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_wait_with_jitter_is_bounded() {
        let config = RetryConfig::default()
            .with_jitter(true)
            .with_max_delay(Duration::from_secs(10));
        let delay = Duration::from_millis(400);
        for _ in 0..100 {
            let wait = config.wait_for(delay);
            assert!(wait >= delay);
            assert!(wait <= Duration::from_millis(500));
        }
    }

    #[test]
    fn test_wait_is_capped() {
        let config = RetryConfig::default()
            .with_jitter(true)
            .with_max_delay(Duration::from_millis(50));
        assert_eq!(
            config.wait_for(Duration::from_millis(400)),
            Duration::from_millis(50)
        );
    }

    #[test]
    fn test_debug_hides_predicate() {
        let config = RetryConfig::default().with_retry_on(|_| true);
        let debug = format!("{:?}", config);
        assert!(debug.contains("custom"));
    }
}
