// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dual-pool PostgreSQL work multiplexer.
//!
//! A single process often needs latency-sensitive database I/O and
//! CPU-heavy computation at the same time, without either starving the
//! other. Sluice splits one connection budget across two kinds of
//! executors:
//!
//! - a **local pool** the calling task queries directly, and
//! - a fleet of **workers**, each a dedicated OS thread with its own
//!   Postgres pool, for registered CPU tasks and for sessions pinned to one
//!   backend connection.
//!
//! Every database touch is protected by retry-with-backoff plus a circuit
//! breaker, replicated independently on the dispatcher side and inside each
//! worker, and every error leaving the API carries an [`ErrorCategory`].
//!
//! # Example
//!
//! ```ignore
//! use serde_json::json;
//! use sluice::{Sluice, SluiceConfig, TaskRegistry};
//!
//! let registry = TaskRegistry::builder()
//!     .task("add", |args| {
//!         let (a, b): (i64, i64) = serde_json::from_value(args)?;
//!         Ok(json!(a + b))
//!     })
//!     .session_task("count_rows", |client, _args| {
//!         Box::pin(async move {
//!             let rows = client.query("SELECT count(*) AS n FROM t", vec![]).await?;
//!             Ok(rows.first("n").cloned().unwrap_or_default())
//!         })
//!     })
//!     .build();
//!
//! # async fn run() -> sluice::Result<()> {
//! let sluice = Sluice::with_registry(
//!     SluiceConfig::new("postgres://localhost/app").with_max_workers(4),
//!     registry,
//! )?;
//!
//! let rows = sluice.query("SELECT 1 AS value", &[]).await?;
//! let sum = sluice.task("add", json!([5, 10])).await?;
//! let count = sluice.session("count_rows", json!(null)).await?;
//! sluice.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod query;
pub mod registry;
pub mod resilience;
pub mod retry;
pub mod session;
pub mod worker;

pub use breaker::{BreakerConfig, BreakerState, CircuitBreaker};
pub use config::{ConfigError, SluiceConfig};
pub use dispatcher::{PoolPlan, Sluice};
pub use error::{classify, ErrorCategory, Result, SluiceError};
pub use query::{QueryResult, QuerySpec};
pub use registry::{TaskRegistry, TaskRegistryBuilder};
pub use resilience::Resilience;
pub use retry::RetryConfig;
pub use session::Session;
pub use worker::SessionClient;

pub use sluice_protocol as protocol;
