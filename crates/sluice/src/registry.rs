// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registry of compiled-in task handlers.
//!
//! Workers cannot receive code over the transport, only values; callers ship
//! an opaque task name plus arguments and the worker resolves the name here.
//! The registry is built once at startup and immutable afterwards, so lookup
//! is lock-free.
//!
//! Two handler kinds exist:
//! - CPU tasks: pure compute, no database client, run inline on the worker
//!   thread.
//! - Session tasks: run against a client checked out and pinned for the
//!   duration of the call, released by the worker on every exit path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::Result;
use crate::worker::SessionClient;

/// A pure compute handler.
pub type CpuTask = dyn Fn(Value) -> Result<Value> + Send + Sync;

/// A handler that runs inside a worker against the pinned client.
pub type SessionTask =
    dyn for<'a> Fn(&'a mut SessionClient, Value) -> BoxFuture<'a, Result<Value>> + Send + Sync;

/// Immutable name-to-handler table shared by every worker.
#[derive(Default)]
pub struct TaskRegistry {
    cpu: HashMap<String, Arc<CpuTask>>,
    session: HashMap<String, Arc<SessionTask>>,
}

impl TaskRegistry {
    /// Start building a registry.
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder {
            registry: TaskRegistry::default(),
        }
    }

    /// An empty registry, for instances that only use `query`.
    pub fn empty() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Look up a CPU task.
    pub fn cpu_task(&self, name: &str) -> Option<Arc<CpuTask>> {
        self.cpu.get(name).cloned()
    }

    /// Look up a session task.
    pub fn session_task(&self, name: &str) -> Option<Arc<SessionTask>> {
        self.session.get(name).cloned()
    }

    /// Number of registered handlers of both kinds.
    pub fn len(&self) -> usize {
        self.cpu.len() + self.session.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty() && self.session.is_empty()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("cpu", &self.cpu.keys().collect::<Vec<_>>())
            .field("session", &self.session.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builder for [`TaskRegistry`]. Registering the same name twice replaces
/// the earlier handler of the same kind.
pub struct TaskRegistryBuilder {
    registry: TaskRegistry,
}

impl TaskRegistryBuilder {
    /// Register a CPU task under `name`.
    pub fn task(
        mut self,
        name: impl Into<String>,
        handler: impl Fn(Value) -> Result<Value> + Send + Sync + 'static,
    ) -> Self {
        self.registry.cpu.insert(name.into(), Arc::new(handler));
        self
    }

    /// Register a session task under `name`.
    pub fn session_task<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut SessionClient, Value) -> BoxFuture<'a, Result<Value>>
            + Send
            + Sync
            + 'static,
    {
        self.registry.session.insert(name.into(), Arc::new(handler));
        self
    }

    /// Finish building.
    pub fn build(self) -> Arc<TaskRegistry> {
        Arc::new(self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_registry() {
        let registry = TaskRegistry::empty();
        assert!(registry.is_empty());
        assert_eq!(registry.len(), 0);
        assert!(registry.cpu_task("anything").is_none());
        assert!(registry.session_task("anything").is_none());
    }

    #[test]
    fn test_cpu_task_lookup_and_call() {
        let registry = TaskRegistry::builder()
            .task("double", |args: Value| {
                let n = args.as_i64().unwrap_or(0);
                Ok(json!(n * 2))
            })
            .build();

        assert_eq!(registry.len(), 1);
        let task = registry.cpu_task("double").unwrap();
        assert_eq!(task(json!(21)).unwrap(), json!(42));
        assert!(registry.cpu_task("triple").is_none());
    }

    #[test]
    fn test_session_task_registration() {
        let registry = TaskRegistry::builder()
            .session_task("noop", |_client: &mut SessionClient, args| {
                Box::pin(async move { Ok(args) })
            })
            .build();

        assert!(registry.session_task("noop").is_some());
        // Kinds are separate namespaces.
        assert!(registry.cpu_task("noop").is_none());
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = TaskRegistry::builder()
            .task("answer", |_| Ok(json!(1)))
            .task("answer", |_| Ok(json!(2)))
            .build();

        assert_eq!(registry.len(), 1);
        let task = registry.cpu_task("answer").unwrap();
        assert_eq!(task(json!(null)).unwrap(), json!(2));
    }

    #[test]
    fn test_debug_lists_names() {
        let registry = TaskRegistry::builder().task("sum", |_| Ok(json!(0))).build();
        let debug = format!("{:?}", registry);
        assert!(debug.contains("sum"));
    }
}
