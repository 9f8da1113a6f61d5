// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tagged messages exchanged between the dispatcher and its workers.
//!
//! Every outbound [`Request`] carries a fresh request id; the worker answers
//! with exactly one [`Reply`] tagged with the same id plus its own worker id,
//! which is how the dispatcher correlates responses and clears slot state.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Stable identifier of a worker within one dispatcher.
pub type WorkerId = u32;

/// A SQL statement plus positional parameters in wire form.
///
/// Parameters are plain JSON values; the executing side binds them by JSON
/// type (null, bool, integer, float, string; arrays and objects bind as
/// JSONB).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuerySpec {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl QuerySpec {
    /// Create a spec with no parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Attach positional parameters.
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }
}

/// A registered task invocation: name plus value-only arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskCall {
    pub task: String,
    #[serde(default)]
    pub args: Value,
}

/// Requests sent from the dispatcher to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Execute a registered CPU task and reply with its return value. No
    /// database client is involved.
    Task {
        request_id: Uuid,
        task: String,
        #[serde(default)]
        args: Value,
    },

    /// Begin a session. With `task` set, the worker checks out a client,
    /// runs the registered session task against it, releases the client on
    /// every path, and replies with the task's return value. Without `task`,
    /// the worker checks out a client, pins it under `session_id`, and
    /// replies with an acknowledgement; subsequent [`Request::SessionQuery`]
    /// messages address the pinned client.
    SessionStart {
        request_id: Uuid,
        session_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        task: Option<TaskCall>,
    },

    /// Run a query on the client pinned under `session_id`.
    SessionQuery {
        request_id: Uuid,
        session_id: Uuid,
        query: QuerySpec,
    },

    /// Release the client pinned under `session_id`. `failed` mirrors the
    /// outcome of the caller-side session body: a failed session discards
    /// the underlying connection instead of returning it to the pool.
    SessionEnd {
        request_id: Uuid,
        session_id: Uuid,
        failed: bool,
    },
}

impl Request {
    /// The correlation id carried by this request.
    pub fn request_id(&self) -> Uuid {
        match self {
            Self::Task { request_id, .. }
            | Self::SessionStart { request_id, .. }
            | Self::SessionQuery { request_id, .. }
            | Self::SessionEnd { request_id, .. } => *request_id,
        }
    }

    /// The session this request addresses, if any.
    pub fn session_id(&self) -> Option<Uuid> {
        match self {
            Self::Task { .. } => None,
            Self::SessionStart { session_id, .. }
            | Self::SessionQuery { session_id, .. }
            | Self::SessionEnd { session_id, .. } => Some(*session_id),
        }
    }

    /// Short name of the message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Task { .. } => "task",
            Self::SessionStart { .. } => "session_start",
            Self::SessionQuery { .. } => "session_query",
            Self::SessionEnd { .. } => "session_end",
        }
    }
}

/// Error payload carried in a failed reply.
///
/// `category` is the snake_case name of the error category assigned at the
/// worker boundary; the dispatcher rebuilds a categorized error from it. An
/// unknown or empty category maps to the unknown category on receipt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    pub message: String,
    #[serde(default)]
    pub category: String,
}

impl WireError {
    pub fn new(message: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            category: category.into(),
        }
    }
}

/// Result payload of a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok {
        #[serde(default)]
        data: Value,
    },
    Err {
        error: WireError,
    },
}

/// A worker's answer to exactly one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub request_id: Uuid,
    pub worker_id: WorkerId,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl Reply {
    /// Build a successful reply.
    pub fn ok(request_id: Uuid, worker_id: WorkerId, data: Value) -> Self {
        Self {
            request_id,
            worker_id,
            outcome: Outcome::Ok { data },
        }
    }

    /// Build a failed reply.
    pub fn err(request_id: Uuid, worker_id: WorkerId, error: WireError) -> Self {
        Self {
            request_id,
            worker_id,
            outcome: Outcome::Err { error },
        }
    }

    /// True if the reply carries data rather than an error.
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, Outcome::Ok { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_id_accessor() {
        let id = Uuid::new_v4();
        let request = Request::Task {
            request_id: id,
            task: "sum".to_string(),
            args: json!([1, 2]),
        };
        assert_eq!(request.request_id(), id);
        assert_eq!(request.session_id(), None);
        assert_eq!(request.kind(), "task");
    }

    #[test]
    fn test_session_id_accessor() {
        let request_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let request = Request::SessionQuery {
            request_id,
            session_id,
            query: QuerySpec::new("SELECT 1"),
        };
        assert_eq!(request.session_id(), Some(session_id));
        assert_eq!(request.kind(), "session_query");
    }

    #[test]
    fn test_request_round_trip() {
        let request = Request::SessionStart {
            request_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            task: Some(TaskCall {
                task: "report".to_string(),
                args: json!({ "limit": 10 }),
            }),
        };
        let encoded = serde_json::to_string(&request).unwrap();
        let decoded: Request = serde_json::from_str(&encoded).unwrap();
        assert_eq!(request.request_id(), decoded.request_id());
        assert_eq!(request.session_id(), decoded.session_id());
        assert_eq!(decoded.kind(), "session_start");
    }

    #[test]
    fn test_pin_only_session_start_omits_task() {
        let request = Request::SessionStart {
            request_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            task: None,
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert!(encoded.get("task").is_none());
    }

    #[test]
    fn test_reply_ok_round_trip() {
        let reply = Reply::ok(Uuid::new_v4(), 3, json!({ "rows": [] }));
        assert!(reply.is_ok());

        let encoded = serde_json::to_string(&reply).unwrap();
        let decoded: Reply = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.request_id, reply.request_id);
        assert_eq!(decoded.worker_id, 3);
        assert!(decoded.is_ok());
    }

    #[test]
    fn test_reply_err_round_trip() {
        let reply = Reply::err(
            Uuid::new_v4(),
            0,
            WireError::new("deadlock detected", "deadlock"),
        );
        assert!(!reply.is_ok());

        let encoded = serde_json::to_string(&reply).unwrap();
        let decoded: Reply = serde_json::from_str(&encoded).unwrap();
        match decoded.outcome {
            Outcome::Err { error } => {
                assert_eq!(error.message, "deadlock detected");
                assert_eq!(error.category, "deadlock");
            }
            Outcome::Ok { .. } => panic!("expected error outcome"),
        }
    }

    #[test]
    fn test_wire_error_default_category() {
        let decoded: WireError = serde_json::from_str(r#"{"message":"boom"}"#).unwrap();
        assert_eq!(decoded.message, "boom");
        assert_eq!(decoded.category, "");
    }

    #[test]
    fn test_query_spec_builder() {
        let spec = QuerySpec::new("SELECT $1").with_params(vec![json!(42)]);
        assert_eq!(spec.sql, "SELECT $1");
        assert_eq!(spec.params, vec![json!(42)]);
    }
}
