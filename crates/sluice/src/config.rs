// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for a sluice instance.
//!
//! Immutable after construction; there is no dynamic reconfiguration.

use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::retry::RetryConfig;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required value or environment variable is missing.
    #[error("missing required configuration: {0}")]
    Missing(&'static str),

    /// A value is present but unusable.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Sluice configuration.
#[derive(Debug, Clone)]
pub struct SluiceConfig {
    /// Postgres connection URL (required, non-empty).
    pub connection_string: String,
    /// Total connection budget shared by the local pool and all worker
    /// pools. At least 1.
    pub max_connections: u32,
    /// Worker count. Zero disables `task` and `session`.
    pub max_workers: u32,
    /// How long a pool acquisition may wait before failing.
    pub acquire_timeout: Duration,
    /// Retry policy applied on the main side and inside every worker.
    pub retry: RetryConfig,
    /// Breaker settings applied on the main side and inside every worker.
    pub breaker: BreakerConfig,
}

impl SluiceConfig {
    /// Create a configuration with defaults: 10 connections, one worker per
    /// CPU, 30s acquire timeout.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            max_connections: 10,
            max_workers: num_cpus::get() as u32,
            acquire_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `SLUICE_DATABASE_URL`: Postgres connection string
    ///
    /// Optional (with defaults):
    /// - `SLUICE_MAX_CONNECTIONS`: total connection budget (default: 10)
    /// - `SLUICE_MAX_WORKERS`: worker count (default: CPU count)
    /// - `SLUICE_ACQUIRE_TIMEOUT_MS`: pool acquire timeout (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        let connection_string = std::env::var("SLUICE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("SLUICE_DATABASE_URL"))?;

        let mut config = Self::new(connection_string);

        if let Ok(raw) = std::env::var("SLUICE_MAX_CONNECTIONS") {
            config.max_connections = raw
                .parse()
                .map_err(|_| ConfigError::Invalid("SLUICE_MAX_CONNECTIONS", raw.clone()))?;
        }
        if let Ok(raw) = std::env::var("SLUICE_MAX_WORKERS") {
            config.max_workers = raw
                .parse()
                .map_err(|_| ConfigError::Invalid("SLUICE_MAX_WORKERS", raw.clone()))?;
        }
        if let Ok(raw) = std::env::var("SLUICE_ACQUIRE_TIMEOUT_MS") {
            let ms: u64 = raw
                .parse()
                .map_err(|_| ConfigError::Invalid("SLUICE_ACQUIRE_TIMEOUT_MS", raw.clone()))?;
            config.acquire_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the total connection budget.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set the worker count. Zero disables worker-backed operations.
    pub fn with_max_workers(mut self, max_workers: u32) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Set the pool acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the breaker configuration.
    pub fn with_breaker(mut self, breaker: BreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    /// Check the construction-time invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.connection_string.trim().is_empty() {
            return Err(ConfigError::Missing("connection_string"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections",
                "must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SluiceConfig::new("postgres://localhost/app");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.max_workers, num_cpus::get() as u32);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SluiceConfig::new("postgres://localhost/app")
            .with_max_connections(24)
            .with_max_workers(4)
            .with_acquire_timeout(Duration::from_secs(5));
        assert_eq!(config.max_connections, 24);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_empty_connection_string_rejected() {
        let config = SluiceConfig::new("   ");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("connection_string"))
        ));
    }

    #[test]
    fn test_zero_budget_rejected() {
        let config = SluiceConfig::new("postgres://localhost/app").with_max_connections(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid("max_connections", _))
        ));
    }

    #[test]
    fn test_zero_workers_allowed() {
        let config = SluiceConfig::new("postgres://localhost/app").with_max_workers(0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_error_display() {
        assert_eq!(
            ConfigError::Missing("SLUICE_DATABASE_URL").to_string(),
            "missing required configuration: SLUICE_DATABASE_URL"
        );
        assert_eq!(
            ConfigError::Invalid("SLUICE_MAX_WORKERS", "abc".to_string()).to_string(),
            "invalid value for SLUICE_MAX_WORKERS: abc"
        );
    }
}
