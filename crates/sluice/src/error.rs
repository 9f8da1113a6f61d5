// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error taxonomy, classification, and wrapping.
//!
//! Every error that leaves the public API is a [`SluiceError`]: a message, an
//! [`ErrorCategory`] assigned at the boundary between untrusted code (the
//! Postgres driver, user tasks) and the dispatcher, and the original cause
//! for diagnostics. Internal rethrows never re-wrap.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};
use sluice_protocol::envelope::WireError;
use uuid::Uuid;

/// Result type using [`SluiceError`].
pub type Result<T> = std::result::Result<T, SluiceError>;

/// Category assigned to every error at the wrapping boundary.
///
/// Categorization is a pure function of the error value; the category drives
/// the default retry predicate and lets callers route failures without
/// string-matching messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Short-lived failure with no more specific class; retry is likely to
    /// succeed.
    Transient,
    /// The backend connection was lost, refused, or the pool is unusable.
    Connection,
    /// A statement or acquisition timed out (including server-side `57014`).
    Timeout,
    /// The server chose this transaction as a deadlock victim (`40P01`).
    Deadlock,
    /// Serialization failure under concurrent transactions (`40001`).
    Serialization,
    /// Integrity constraint violation (SQLSTATE class `23`).
    Constraint,
    /// Malformed SQL or schema mismatch (SQLSTATE class `42`).
    Syntax,
    /// Anything else.
    #[default]
    Unknown,
}

impl ErrorCategory {
    /// Returns the snake_case name of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Deadlock => "deadlock",
            Self::Serialization => "serialization",
            Self::Constraint => "constraint",
            Self::Syntax => "syntax",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a category from its snake_case name.
    pub fn from_str(s: &str) -> Self {
        match s {
            "transient" => Self::Transient,
            "connection" => Self::Connection,
            "timeout" => Self::Timeout,
            "deadlock" => Self::Deadlock,
            "serialization" => Self::Serialization,
            "constraint" => Self::Constraint,
            "syntax" => Self::Syntax,
            _ => Self::Unknown,
        }
    }

    /// True for the categories the default retry predicate considers
    /// worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transient
                | Self::Connection
                | Self::Timeout
                | Self::Deadlock
                | Self::Serialization
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The canonical error value at the public API boundary.
pub struct SluiceError {
    message: String,
    category: ErrorCategory,
    /// True for breaker pre-call rejections; these are never retried and the
    /// worker rewrites them into its own connection-class signal.
    rejection: bool,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl SluiceError {
    /// Create an error with an explicit category and no cause.
    pub fn new(message: impl Into<String>, category: ErrorCategory) -> Self {
        let mut message = message.into();
        if message.is_empty() {
            message = "Unknown error".to_string();
        }
        Self {
            message,
            category,
            rejection: false,
            source: None,
        }
    }

    /// Wrap an arbitrary error: classify it, copy the innermost message, and
    /// keep the original as the cause. Wrapping a `SluiceError` returns it
    /// unchanged.
    pub fn wrap<E>(err: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let err: Box<dyn StdError + Send + Sync> = err.into();
        match err.downcast::<SluiceError>() {
            Ok(already_wrapped) => *already_wrapped,
            Err(err) => {
                let category = classify(&*err);
                let message = innermost_message(&*err);
                Self {
                    message,
                    category,
                    rejection: false,
                    source: Some(err),
                }
            }
        }
    }

    /// Rebuild a categorized error from a worker's wire payload.
    pub fn from_wire(error: WireError) -> Self {
        Self::new(error.message, ErrorCategory::from_str(&error.category))
    }

    /// Convert into the wire payload carried by a failed reply.
    pub fn to_wire(&self) -> WireError {
        WireError::new(self.message.clone(), self.category.as_str())
    }

    /// The category assigned at wrap time.
    pub fn category(&self) -> ErrorCategory {
        self.category
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True for breaker pre-call rejections.
    pub fn is_breaker_rejection(&self) -> bool {
        self.rejection
    }

    fn rejection(message: impl Into<String>, category: ErrorCategory) -> Self {
        let mut err = Self::new(message, category);
        err.rejection = true;
        err
    }

    // Operational signals. These are surfaced as-is and never retried.

    /// The dispatcher has been shut down.
    pub fn shut_down() -> Self {
        Self::new("Instance has been shut down", ErrorCategory::Unknown)
    }

    /// Worker-backed operations were requested on a zero-worker config.
    pub fn no_workers() -> Self {
        Self::new(
            "No workers available: instance was configured with max_workers = 0",
            ErrorCategory::Unknown,
        )
    }

    /// The main-side breaker rejected the call while open.
    pub fn breaker_open() -> Self {
        Self::rejection("Circuit breaker is open", ErrorCategory::Unknown)
    }

    /// The breaker rejected the call because all half-open permits are taken.
    pub fn breaker_trial_limit() -> Self {
        Self::rejection(
            "Circuit breaker trial limit reached",
            ErrorCategory::Unknown,
        )
    }

    /// A worker's breaker rejected the call; connection-class so the caller's
    /// retry policy treats the worker as a flaky backend.
    pub fn worker_breaker_open() -> Self {
        Self::new("Worker circuit breaker is open", ErrorCategory::Connection)
    }

    /// A session query reached a worker that no longer holds the client.
    pub fn client_not_found(session_id: Uuid) -> Self {
        Self::new(
            format!("Client {session_id} not found"),
            ErrorCategory::Unknown,
        )
    }

    /// A task name was not registered.
    pub fn task_not_found(name: &str) -> Self {
        Self::new(
            format!("Task '{name}' not found or not registered"),
            ErrorCategory::Unknown,
        )
    }

    /// The session proxy was used after the enclosing call returned.
    pub fn session_released() -> Self {
        Self::new("Session has been released", ErrorCategory::Unknown)
    }
}

impl fmt::Display for SluiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl fmt::Debug for SluiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SluiceError")
            .field("message", &self.message)
            .field("category", &self.category)
            .field("source", &self.source)
            .finish()
    }
}

impl StdError for SluiceError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|s| s.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<sqlx::Error> for SluiceError {
    fn from(err: sqlx::Error) -> Self {
        Self::wrap(err)
    }
}

impl From<sluice_protocol::CodecError> for SluiceError {
    fn from(err: sluice_protocol::CodecError) -> Self {
        Self::wrap(err)
    }
}

impl From<serde_json::Error> for SluiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::wrap(err)
    }
}

impl From<sluice_protocol::TransportError> for SluiceError {
    fn from(err: sluice_protocol::TransportError) -> Self {
        let mut wrapped = Self::wrap(err);
        wrapped.category = ErrorCategory::Connection;
        wrapped
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Categorize an error value.
///
/// The error chain is walked outermost-first, twice: code-based rules
/// (SQLSTATE, IO kind, driver class) win over message substrings anywhere in
/// the chain, which is the "peel the aggregate, prefer codes" order.
pub fn classify(err: &(dyn StdError + 'static)) -> ErrorCategory {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(category) = classify_by_code(e) {
            return category;
        }
        current = e.source();
    }

    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(category) = classify_message(&e.to_string()) {
            return category;
        }
        current = e.source();
    }

    ErrorCategory::Unknown
}

fn classify_by_code(err: &(dyn StdError + 'static)) -> Option<ErrorCategory> {
    if let Some(sqlx_err) = err.downcast_ref::<sqlx::Error>() {
        return classify_sqlx(sqlx_err);
    }
    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        return classify_io(io_err);
    }
    if let Some(db_err) = err.downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        return classify_sqlstate(db_err.code());
    }
    None
}

fn classify_sqlx(err: &sqlx::Error) -> Option<ErrorCategory> {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| classify_sqlstate(&code))
            .or_else(|| classify_message(db.message())),
        sqlx::Error::Io(io) => classify_io(io).or(Some(ErrorCategory::Connection)),
        sqlx::Error::PoolTimedOut => Some(ErrorCategory::Timeout),
        sqlx::Error::PoolClosed => Some(ErrorCategory::Connection),
        sqlx::Error::Tls(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed => {
            Some(ErrorCategory::Connection)
        }
        sqlx::Error::Configuration(_) => Some(ErrorCategory::Connection),
        _ => None,
    }
}

fn classify_sqlstate(code: &str) -> Option<ErrorCategory> {
    match code {
        "40001" => Some(ErrorCategory::Serialization),
        "40P01" => Some(ErrorCategory::Deadlock),
        "57014" => Some(ErrorCategory::Timeout),
        "57P01" | "57P02" => Some(ErrorCategory::Connection),
        _ if code.starts_with("23") => Some(ErrorCategory::Constraint),
        _ if code.starts_with("42") => Some(ErrorCategory::Syntax),
        _ => None,
    }
}

fn classify_io(err: &std::io::Error) -> Option<ErrorCategory> {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut => Some(ErrorCategory::Timeout),
        ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionAborted
        | ErrorKind::BrokenPipe
        | ErrorKind::NotConnected => Some(ErrorCategory::Connection),
        _ => None,
    }
}

fn classify_message(message: &str) -> Option<ErrorCategory> {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        Some(ErrorCategory::Timeout)
    } else if lower.contains("connection") {
        Some(ErrorCategory::Connection)
    } else if lower.contains("deadlock") {
        Some(ErrorCategory::Deadlock)
    } else {
        None
    }
}

/// Message of the deepest cause in the chain, falling back to the outermost
/// message, then to "Unknown error".
fn innermost_message(err: &(dyn StdError + 'static)) -> String {
    let mut deepest = err;
    while let Some(next) = deepest.source() {
        deepest = next;
    }
    let message = deepest.to_string();
    if message.is_empty() {
        "Unknown error".to_string()
    } else {
        message
    }
}
