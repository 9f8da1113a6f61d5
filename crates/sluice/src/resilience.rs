// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Combined breaker-and-retry executor.
//!
//! One [`Resilience`] instance protects one actor: the dispatcher carries one
//! around its local pool and every worker carries its own with independent
//! state. Each inner attempt consults and updates the breaker; retry
//! eligibility is the policy predicate plus the remaining attempt budget.
//! Breaker rejections are surfaced immediately and are never retried.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tracing::info;

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::error::Result;
use crate::retry::RetryConfig;

/// Retry policy plus circuit breaker, shared by cheap clone within one actor.
#[derive(Clone)]
pub struct Resilience {
    retry: RetryConfig,
    breaker: Arc<Mutex<CircuitBreaker>>,
}

impl Resilience {
    pub fn new(retry: RetryConfig, breaker: CircuitBreaker) -> Self {
        Self {
            retry,
            breaker: Arc::new(Mutex::new(breaker)),
        }
    }

    /// The breaker's current state, for observability.
    pub async fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().await.state()
    }

    /// Run an operation that owns everything it captures.
    pub async fn run<T, Fut, F>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut op = op;
        self.run_with(op_name, &mut op, |op: &mut F| Box::pin(op()))
            .await
    }

    /// Run an operation that borrows `state` mutably for each attempt.
    ///
    /// This is the shape needed for operations against a checked-out
    /// connection, where every attempt re-borrows the same client.
    pub async fn run_with<S, T>(
        &self,
        op_name: &str,
        state: &mut S,
        mut op: impl for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T>>,
    ) -> Result<T> {
        let mut attempt: u32 = 0;
        let mut delay = self.retry.initial_delay;

        loop {
            attempt += 1;
            self.breaker.lock().await.try_acquire()?;

            match op(&mut *state).await {
                Ok(value) => {
                    self.breaker.lock().await.on_success();
                    return Ok(value);
                }
                Err(err) => {
                    self.breaker.lock().await.on_failure();
                    if attempt >= self.retry.max_attempts || !self.retry.should_retry(&err) {
                        return Err(err);
                    }

                    let wait = self.retry.wait_for(delay);
                    info!(
                        op = op_name,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = wait.as_millis() as u64,
                        error = %err,
                        "Retrying after failure"
                    );
                    tokio::time::sleep(wait).await;
                    delay = self.retry.next_delay(delay);
                }
            }
        }
    }
}
