// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport adapter between the dispatcher and its workers.
//!
//! The dispatcher talks to workers through the [`Transport`] trait: spawn a
//! worker, send it requests, consume one shared inbound stream of replies,
//! and terminate workers on shutdown. [`ChannelTransport`] is the in-process
//! implementation: each worker runs on a dedicated OS thread with its own
//! single-threaded tokio runtime, so CPU-heavy work in a worker never stalls
//! the caller's runtime, and channels carry the value-only envelopes in both
//! directions.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::envelope::{Reply, Request, WorkerId};

/// Default time allowed for a spawned worker to report online.
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors raised by the transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("worker {0} is not running")]
    WorkerGone(WorkerId),

    #[error("worker {0} failed to start: {1}")]
    SpawnFailed(WorkerId, String),
}

/// Cheap-to-clone handle for sending requests to one worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    worker_id: WorkerId,
    tx: mpsc::UnboundedSender<Request>,
}

impl WorkerHandle {
    /// Assemble a handle from its parts. Intended for [`Transport`]
    /// implementations.
    pub fn new(worker_id: WorkerId, tx: mpsc::UnboundedSender<Request>) -> Self {
        Self { worker_id, tx }
    }

    /// The stable id of the worker behind this handle.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Queue a request into the worker's receive loop.
    pub fn send(&self, request: Request) -> Result<(), TransportError> {
        self.tx
            .send(request)
            .map_err(|_| TransportError::WorkerGone(self.worker_id))
    }
}

/// Everything a worker body receives from the transport on startup.
pub struct WorkerContext {
    /// Stable id assigned by the dispatcher.
    pub worker_id: WorkerId,
    /// Inbound requests, processed one at a time.
    pub requests: mpsc::UnboundedReceiver<Request>,
    /// Shared sink for replies back to the dispatcher.
    pub replies: mpsc::UnboundedSender<Reply>,
    /// Fired once the worker is able to process messages.
    pub ready: oneshot::Sender<()>,
    /// Cancelled when the dispatcher terminates this worker.
    pub shutdown: CancellationToken,
}

/// The code that runs for the lifetime of one worker thread.
///
/// The body owns the thread: it is expected to build whatever runtime it
/// needs, signal `ready`, and block until the request channel closes or the
/// shutdown token fires.
pub type WorkerBody = dyn Fn(WorkerContext) + Send + Sync;

/// Abstract transport the dispatcher is written against.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Spawn a worker and wait for its online report.
    async fn spawn(&self, worker_id: WorkerId) -> Result<WorkerHandle, TransportError>;

    /// Send a request to a spawned worker.
    fn send(&self, worker: &WorkerHandle, request: Request) -> Result<(), TransportError> {
        worker.send(request)
    }

    /// Take the single inbound reply stream. Returns `None` after the first
    /// call.
    async fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Reply>>;

    /// Terminate one worker and wait for its thread to exit.
    async fn terminate(&self, worker_id: WorkerId);

    /// Terminate every worker this transport has spawned.
    async fn terminate_all(&self);
}

struct WorkerThread {
    tx: mpsc::UnboundedSender<Request>,
    stop: CancellationToken,
    join: thread::JoinHandle<()>,
}

/// In-process transport: one OS thread per worker.
pub struct ChannelTransport {
    body: Arc<WorkerBody>,
    reply_tx: mpsc::UnboundedSender<Reply>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<Reply>>>,
    threads: Mutex<HashMap<WorkerId, WorkerThread>>,
    spawn_timeout: Duration,
}

impl ChannelTransport {
    /// Create a transport that runs `body` on every spawned worker thread.
    pub fn new(body: impl Fn(WorkerContext) + Send + Sync + 'static) -> Self {
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        Self {
            body: Arc::new(body),
            reply_tx,
            inbound: Mutex::new(Some(reply_rx)),
            threads: Mutex::new(HashMap::new()),
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
        }
    }

    /// Override how long `spawn` waits for the online report.
    pub fn with_spawn_timeout(mut self, timeout: Duration) -> Self {
        self.spawn_timeout = timeout;
        self
    }

    async fn join_thread(worker_id: WorkerId, entry: WorkerThread) {
        let WorkerThread { tx, stop, join } = entry;
        stop.cancel();
        drop(tx);

        let joined = tokio::task::spawn_blocking(move || join.join()).await;
        match joined {
            Ok(Ok(())) => debug!(worker_id, "Worker thread exited"),
            Ok(Err(_)) => error!(worker_id, "Worker thread panicked"),
            Err(e) => warn!(worker_id, error = %e, "Failed to join worker thread"),
        }
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn spawn(&self, worker_id: WorkerId) -> Result<WorkerHandle, TransportError> {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let stop = CancellationToken::new();

        let context = WorkerContext {
            worker_id,
            requests: req_rx,
            replies: self.reply_tx.clone(),
            ready: ready_tx,
            shutdown: stop.clone(),
        };

        let body = self.body.clone();
        let join = thread::Builder::new()
            .name(format!("sluice-worker-{worker_id}"))
            .spawn(move || body(context))
            .map_err(|e| TransportError::SpawnFailed(worker_id, e.to_string()))?;

        match tokio::time::timeout(self.spawn_timeout, ready_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                return Err(TransportError::SpawnFailed(
                    worker_id,
                    "worker exited before reporting online".to_string(),
                ));
            }
            Err(_) => {
                stop.cancel();
                return Err(TransportError::SpawnFailed(
                    worker_id,
                    "timed out waiting for online report".to_string(),
                ));
            }
        }

        let mut threads = self.threads.lock().await;
        if let Some(previous) = threads.insert(
            worker_id,
            WorkerThread {
                tx: req_tx.clone(),
                stop,
                join,
            },
        ) {
            warn!(worker_id, "Replacing a previously spawned worker");
            Self::join_thread(worker_id, previous).await;
        }
        drop(threads);

        info!(worker_id, "Worker online");
        Ok(WorkerHandle {
            worker_id,
            tx: req_tx,
        })
    }

    async fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<Reply>> {
        self.inbound.lock().await.take()
    }

    async fn terminate(&self, worker_id: WorkerId) {
        let entry = self.threads.lock().await.remove(&worker_id);
        if let Some(entry) = entry {
            Self::join_thread(worker_id, entry).await;
        }
    }

    async fn terminate_all(&self) {
        let entries: Vec<(WorkerId, WorkerThread)> =
            self.threads.lock().await.drain().collect();
        for (worker_id, entry) in entries {
            Self::join_thread(worker_id, entry).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::WireError;
    use serde_json::json;
    use uuid::Uuid;

    /// Worker body that echoes task args back as the reply data.
    fn echo_body(context: WorkerContext) {
        let WorkerContext {
            worker_id,
            mut requests,
            replies,
            ready,
            shutdown,
        } = context;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async move {
            if ready.send(()).is_err() {
                return;
            }
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => break,

                    message = requests.recv() => match message {
                        Some(Request::Task { request_id, args, .. }) => {
                            let _ = replies.send(Reply::ok(request_id, worker_id, args));
                        }
                        Some(other) => {
                            let _ = replies.send(Reply::err(
                                other.request_id(),
                                worker_id,
                                WireError::new("unsupported", "unknown"),
                            ));
                        }
                        None => break,
                    },
                }
            }
        });
    }

    #[tokio::test]
    async fn test_spawn_send_reply_terminate() {
        let transport = ChannelTransport::new(echo_body);
        let mut inbound = transport.take_inbound().await.unwrap();

        let worker = transport.spawn(0).await.unwrap();
        assert_eq!(worker.worker_id(), 0);

        let request_id = Uuid::new_v4();
        worker
            .send(Request::Task {
                request_id,
                task: "echo".to_string(),
                args: json!({ "n": 1 }),
            })
            .unwrap();

        let reply = inbound.recv().await.unwrap();
        assert_eq!(reply.request_id, request_id);
        assert_eq!(reply.worker_id, 0);
        assert!(reply.is_ok());

        transport.terminate(0).await;
    }

    #[tokio::test]
    async fn test_inbound_taken_once() {
        let transport = ChannelTransport::new(echo_body);
        assert!(transport.take_inbound().await.is_some());
        assert!(transport.take_inbound().await.is_none());
    }

    #[tokio::test]
    async fn test_send_after_terminate_fails() {
        let transport = ChannelTransport::new(echo_body);
        let _inbound = transport.take_inbound().await.unwrap();

        let worker = transport.spawn(7).await.unwrap();
        transport.terminate(7).await;

        let err = worker
            .send(Request::Task {
                request_id: Uuid::new_v4(),
                task: "echo".to_string(),
                args: json!(null),
            })
            .unwrap_err();
        assert!(matches!(err, TransportError::WorkerGone(7)));
    }

    #[tokio::test]
    async fn test_spawn_failure_when_body_never_reports() {
        // A body that exits immediately without firing `ready`.
        let transport = ChannelTransport::new(|_context: WorkerContext| {});
        let err = transport.spawn(1).await.unwrap_err();
        assert!(matches!(err, TransportError::SpawnFailed(1, _)));
    }

    #[tokio::test]
    async fn test_terminate_all() {
        let transport = ChannelTransport::new(echo_body);
        let _inbound = transport.take_inbound().await.unwrap();

        for id in 0..3 {
            transport.spawn(id).await.unwrap();
        }
        transport.terminate_all().await;
        assert!(transport.threads.lock().await.is_empty());
    }

    #[test]
    fn test_transport_error_display() {
        assert_eq!(
            TransportError::WorkerGone(4).to_string(),
            "worker 4 is not running"
        );
        assert_eq!(
            TransportError::SpawnFailed(2, "boom".to_string()).to_string(),
            "worker 2 failed to start: boom"
        );
    }
}
