// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Caller-side session proxy.
//!
//! A [`Session`] is handed to the body of a `session_with` call and is valid
//! only for its dynamic extent. Every query tunnels to the worker holding
//! this session's pinned client, so a sequence of queries on one session
//! observes one backend connection in order. The proxy exposes no release
//! operation; the enclosing call controls the lifecycle and any use after it
//! returns fails with a defined error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use sluice_protocol::envelope::{QuerySpec, Request, WorkerId};
use sluice_protocol::from_wire_value;
use sluice_protocol::transport::WorkerHandle;

use crate::dispatcher::DispatcherState;
use crate::error::{Result, SluiceError};
use crate::query::QueryResult;

/// Handle to a client pinned on one worker.
pub struct Session {
    session_id: Uuid,
    worker: WorkerHandle,
    state: Arc<Mutex<DispatcherState>>,
    released: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        session_id: Uuid,
        worker: WorkerHandle,
        state: Arc<Mutex<DispatcherState>>,
    ) -> Self {
        Self {
            session_id,
            worker,
            state,
            released: AtomicBool::new(false),
        }
    }

    /// The session id.
    pub fn id(&self) -> Uuid {
        self.session_id
    }

    /// The worker this session is bound to.
    pub fn worker_id(&self) -> WorkerId {
        self.worker.worker_id()
    }

    /// Run a statement on this session's pinned connection.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.query_spec(QuerySpec {
            sql: sql.to_string(),
            params: params.to_vec(),
        })
        .await
    }

    /// Run a prepared spec on this session's pinned connection.
    pub async fn query_spec(&self, spec: QuerySpec) -> Result<QueryResult> {
        if self.released.load(Ordering::Acquire) {
            return Err(SluiceError::session_released());
        }

        let rx = {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return Err(SluiceError::shut_down());
            }

            let request_id = Uuid::new_v4();
            let rx = state.register_pending(request_id, Some(self.session_id));
            if let Err(e) = self.worker.send(Request::SessionQuery {
                request_id,
                session_id: self.session_id,
                query: spec,
            }) {
                state.pending.remove(&request_id);
                return Err(SluiceError::from(e));
            }
            rx
        };

        let data = rx.await.map_err(|_| SluiceError::shut_down())??;
        from_wire_value(data).map_err(SluiceError::wrap)
    }

    /// Invalidate the proxy once the enclosing call finishes.
    pub(crate) fn release(&self) {
        self.released.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_protocol::transport::{ChannelTransport, Transport, WorkerContext};

    fn idle_body(context: WorkerContext) {
        let WorkerContext {
            mut requests,
            ready,
            ..
        } = context;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let _ = ready.send(());
            while requests.recv().await.is_some() {}
        });
    }

    async fn spawned_handle() -> (ChannelTransport, WorkerHandle) {
        let transport = ChannelTransport::new(idle_body);
        let handle = transport.spawn(0).await.unwrap();
        (transport, handle)
    }

    #[tokio::test]
    async fn test_query_after_release_fails() {
        let (transport, handle) = spawned_handle().await;
        let state = Arc::new(Mutex::new(DispatcherState::new()));
        let session = Session::new(Uuid::new_v4(), handle, state);

        session.release();
        let err = session.query("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.message(), "Session has been released");

        transport.terminate_all().await;
    }

    #[tokio::test]
    async fn test_query_after_shutdown_fails() {
        let (transport, handle) = spawned_handle().await;
        let state = Arc::new(Mutex::new(DispatcherState::new()));
        state.lock().await.shut_down = true;

        let session = Session::new(Uuid::new_v4(), handle, state);
        let err = session.query("SELECT 1", &[]).await.unwrap_err();
        assert_eq!(err.message(), "Instance has been shut down");

        transport.terminate_all().await;
    }

    #[tokio::test]
    async fn test_query_registers_and_resolves_pending() {
        let (transport, handle) = spawned_handle().await;
        let state = Arc::new(Mutex::new(DispatcherState::new()));
        let session = Session::new(Uuid::new_v4(), handle, state.clone());

        let state_for_reply = state.clone();
        let resolver = tokio::spawn(async move {
            // Wait for the pending entry, then resolve it the way the reply
            // pump would.
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                let mut st = state_for_reply.lock().await;
                if let Some(request_id) = st.pending.keys().next().copied() {
                    let pending = st.pending.remove(&request_id).unwrap();
                    let payload = serde_json::to_value(QueryResult::default()).unwrap();
                    let _ = pending.resolver.send(Ok(payload));
                    break;
                }
            }
        });

        let result = session.query("SELECT 1", &[]).await.unwrap();
        assert_eq!(result.row_count, 0);
        resolver.await.unwrap();

        // The pending table is empty once the operation resolved.
        assert!(state.lock().await.pending.is_empty());

        transport.terminate_all().await;
    }
}
