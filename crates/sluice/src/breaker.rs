// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Three-state circuit breaker.
//!
//! One breaker protects the dispatcher's local pool and each worker carries
//! its own with independent state. The breaker is consulted before every
//! protected call and updated after every attempt; it trips after a run of
//! consecutive failures, rejects calls while open, and recovers through a
//! bounded half-open trial phase.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::error::SluiceError;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Time the breaker stays open before allowing trial calls.
    pub cooldown: Duration,
    /// Trial calls permitted while half-open.
    pub half_open_max_calls: u32,
    /// Trial successes required to close again.
    pub half_open_successes_to_close: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(10),
            half_open_max_calls: 2,
            half_open_successes_to_close: 2,
        }
    }
}

impl BreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls.max(1);
        self
    }

    pub fn with_half_open_successes_to_close(mut self, successes: u32) -> Self {
        self.half_open_successes_to_close = successes.max(1);
        self
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Mutable breaker state machine. Owned exclusively by one actor; callers
/// serialize access themselves.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_permits: u32,
    half_open_successes: u32,
}

impl CircuitBreaker {
    /// Create a closed breaker with all counters at zero.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_permits: 0,
            half_open_successes: 0,
        }
    }

    /// The current state.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Consecutive failures observed on the closed path.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Pre-call check. Either grants the call or returns the rejection the
    /// caller must surface without executing the protected operation.
    pub fn try_acquire(&mut self) -> Result<(), SluiceError> {
        match self.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.cooldown {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_successes = 0;
                    info!(cooldown_ms = self.config.cooldown.as_millis() as u64,
                        "Circuit breaker entering half-open state");
                    self.take_permit()
                } else {
                    warn!(
                        remaining_ms =
                            (self.config.cooldown - elapsed).as_millis() as u64,
                        "Circuit breaker rejecting call while open"
                    );
                    Err(SluiceError::breaker_open())
                }
            }
            BreakerState::HalfOpen => self.take_permit(),
        }
    }

    /// Record a successful protected call.
    pub fn on_success(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures = 0;
            }
            BreakerState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_successes_to_close {
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                    self.opened_at = None;
                    info!("Circuit breaker closed after successful trial calls");
                }
            }
            // A success can land here from a call granted before the trip.
            BreakerState::Open => {}
        }
    }

    /// Record a failed protected call.
    pub fn on_failure(&mut self) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip();
                }
            }
            BreakerState::HalfOpen => self.trip(),
            BreakerState::Open => {}
        }
    }

    fn take_permit(&mut self) -> Result<(), SluiceError> {
        if self.half_open_permits == 0 {
            warn!("Circuit breaker rejecting call: half-open trial limit reached");
            return Err(SluiceError::breaker_trial_limit());
        }
        self.half_open_permits -= 1;
        Ok(())
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_permits = self.config.half_open_max_calls;
        self.half_open_successes = 0;
        warn!(
            consecutive_failures = self.consecutive_failures,
            "Circuit breaker opened"
        );
    }
}
