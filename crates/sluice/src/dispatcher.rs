// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The dispatcher facade.
//!
//! [`Sluice`] partitions the connection budget between a local pool and a
//! fleet of workers, routes work to the right executor, enforces the
//! main-side breaker and retry policy, correlates worker replies by request
//! id, and owns the lifecycle: workers are spawned lazily on the first
//! worker-backed call, `warmup` drives the same one-shot initialization
//! eagerly, and `shutdown` tears everything down exactly once.
//!
//! All mutable dispatcher state lives under a single mutex; nothing awaits
//! while holding it except the lock acquisition itself.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::{oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use futures::future::BoxFuture;
use sluice_protocol::envelope::{Outcome, QuerySpec, Reply, Request, TaskCall, WorkerId};
use sluice_protocol::to_wire_value;
use sluice_protocol::transport::{ChannelTransport, Transport, WorkerHandle};

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::SluiceConfig;
use crate::error::{Result, SluiceError};
use crate::query::{run_query, QueryResult};
use crate::registry::TaskRegistry;
use crate::resilience::Resilience;
use crate::session::Session;
use crate::worker::{worker_body, WorkerSettings};

// ============================================================================
// Pool partitioning
// ============================================================================

/// How the connection budget `M` is split between the local pool and `W`
/// worker pools.
///
/// The main thread counts as one more consumer: each worker gets
/// `max(1, floor(M / (W + 1)))` connections and the local pool keeps the
/// remainder, never less than one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPlan {
    /// Local pool size `L`.
    pub local: u32,
    /// Per-worker pool size `P`.
    pub per_worker: u32,
    /// Worker count `W`.
    pub workers: u32,
}

impl PoolPlan {
    /// Partition `max_connections` across the local pool and `workers`
    /// worker pools.
    pub fn partition(max_connections: u32, workers: u32) -> Self {
        if workers == 0 {
            return Self {
                local: max_connections.max(1),
                per_worker: 0,
                workers: 0,
            };
        }
        let per_worker = (max_connections / (workers + 1)).max(1);
        let local = max_connections
            .saturating_sub(workers * per_worker)
            .max(1);
        Self {
            local,
            per_worker,
            workers,
        }
    }

    /// Connections accounted for by this plan.
    pub fn total(&self) -> u32 {
        self.local + self.workers * self.per_worker
    }
}

// ============================================================================
// Dispatcher state
// ============================================================================

pub(crate) struct WorkerSlot {
    pub handle: WorkerHandle,
    pub busy: bool,
}

pub(crate) struct PendingRequest {
    pub resolver: oneshot::Sender<Result<Value>>,
    #[allow(dead_code)] // Diagnostic correlation between pendings and sessions
    pub session_id: Option<Uuid>,
}

/// Everything mutable in the dispatcher, under one lock.
pub(crate) struct DispatcherState {
    pub slots: Vec<WorkerSlot>,
    pub pending: HashMap<Uuid, PendingRequest>,
    pub bindings: HashMap<Uuid, WorkerId>,
    pub cursor: usize,
    pub shut_down: bool,
}

impl DispatcherState {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            pending: HashMap::new(),
            bindings: HashMap::new(),
            cursor: 0,
            shut_down: false,
        }
    }

    /// Round-robin pick: scan one pass from the cursor for an idle slot and
    /// fall through to the cursor slot when every worker is busy (the queue
    /// then forms in that worker's receive loop). The cursor advances past
    /// the picked slot.
    pub(crate) fn pick_slot(&mut self) -> usize {
        let count = self.slots.len();
        let start = self.cursor % count;
        let mut chosen = start;
        for offset in 0..count {
            let index = (start + offset) % count;
            if !self.slots[index].busy {
                chosen = index;
                break;
            }
        }
        self.cursor = (chosen + 1) % count;
        chosen
    }

    /// Create a single-shot pending entry for a fresh request id.
    pub(crate) fn register_pending(
        &mut self,
        request_id: Uuid,
        session_id: Option<Uuid>,
    ) -> oneshot::Receiver<Result<Value>> {
        let (resolver, rx) = oneshot::channel();
        self.pending.insert(
            request_id,
            PendingRequest {
                resolver,
                session_id,
            },
        );
        rx
    }

    fn slot_mut(&mut self, worker_id: WorkerId) -> Option<&mut WorkerSlot> {
        self.slots
            .iter_mut()
            .find(|slot| slot.handle.worker_id() == worker_id)
    }
}

// ============================================================================
// Facade
// ============================================================================

/// A dual-pool Postgres work multiplexer.
///
/// One instance owns a local pool for direct queries plus a lazily spawned
/// worker fleet for CPU tasks and pinned sessions. Construction is cheap and
/// synchronous; pools connect lazily and workers spawn on first use.
pub struct Sluice {
    plan: PoolPlan,
    local: PgPool,
    resilience: Resilience,
    registry: Arc<TaskRegistry>,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<DispatcherState>>,
    init: OnceCell<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Sluice {
    /// Create an instance with an empty task registry (query-only use).
    pub fn new(config: SluiceConfig) -> Result<Self> {
        Self::with_registry(config, TaskRegistry::empty())
    }

    /// Create an instance whose workers resolve task names in `registry`.
    pub fn with_registry(config: SluiceConfig, registry: Arc<TaskRegistry>) -> Result<Self> {
        config.validate().map_err(SluiceError::wrap)?;

        let plan = PoolPlan::partition(config.max_connections, config.max_workers);
        let local = PgPoolOptions::new()
            .max_connections(plan.local)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy(&config.connection_string)
            .map_err(SluiceError::wrap)?;

        let resilience = Resilience::new(
            config.retry.clone(),
            CircuitBreaker::new(config.breaker.clone()),
        );

        let settings = WorkerSettings {
            connection_string: config.connection_string.clone(),
            pool_size: plan.per_worker,
            acquire_timeout: config.acquire_timeout,
            retry: config.retry.clone(),
            breaker: config.breaker.clone(),
        };
        let transport: Arc<dyn Transport> =
            Arc::new(ChannelTransport::new(worker_body(settings, registry.clone())));

        debug!(
            local = plan.local,
            per_worker = plan.per_worker,
            workers = plan.workers,
            "Sluice instance created"
        );

        Ok(Self {
            plan,
            local,
            resilience,
            registry,
            transport,
            state: Arc::new(Mutex::new(DispatcherState::new())),
            init: OnceCell::new(),
            pump: Mutex::new(None),
        })
    }

    /// The computed pool partition.
    pub fn plan(&self) -> PoolPlan {
        self.plan
    }

    /// The registry this instance resolves task names in.
    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// The main-side breaker state, for observability.
    pub async fn breaker_state(&self) -> BreakerState {
        self.resilience.breaker_state().await
    }

    /// True once `shutdown` has been called.
    pub async fn is_shut_down(&self) -> bool {
        self.state.lock().await.shut_down
    }

    /// Number of requests awaiting a worker reply.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Number of worker slots currently marked busy.
    pub async fn busy_workers(&self) -> usize {
        self.state
            .lock()
            .await
            .slots
            .iter()
            .filter(|slot| slot.busy)
            .count()
    }

    /// Number of live caller-side sessions.
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.bindings.len()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Run a statement on the local pool under the main-side breaker and
    /// retry policy.
    #[instrument(skip(self, params), fields(sql = sql))]
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        self.query_spec(QuerySpec {
            sql: sql.to_string(),
            params: params.to_vec(),
        })
        .await
    }

    /// Run a prepared spec on the local pool.
    pub async fn query_spec(&self, spec: QuerySpec) -> Result<QueryResult> {
        let pool = self.local.clone();
        self.resilience
            .run("query", move || {
                let pool = pool.clone();
                let spec = spec.clone();
                async move { run_query(&pool, &spec).await }
            })
            .await
    }

    /// Run a registered CPU task on a worker and return its value.
    #[instrument(skip(self, args), fields(task = name))]
    pub async fn task(&self, name: &str, args: impl Serialize) -> Result<Value> {
        let args = to_wire_value(&args).map_err(SluiceError::wrap)?;
        self.ensure_worker_fleet().await?;

        let rx = {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return Err(SluiceError::shut_down());
            }
            if state.slots.is_empty() {
                return Err(SluiceError::no_workers());
            }

            let index = state.pick_slot();
            let request_id = Uuid::new_v4();
            let rx = state.register_pending(request_id, None);
            state.slots[index].busy = true;
            if let Err(e) = state.slots[index].handle.send(Request::Task {
                request_id,
                task: name.to_string(),
                args,
            }) {
                state.pending.remove(&request_id);
                state.slots[index].busy = false;
                return Err(SluiceError::from(e));
            }
            rx
        };

        await_reply(rx).await
    }

    /// Run a registered session task on a worker: the worker checks out a
    /// client, runs the task against it, and releases the client on every
    /// path. One round trip; the reply carries the task's return value.
    #[instrument(skip(self, args), fields(task = name))]
    pub async fn session(&self, name: &str, args: impl Serialize) -> Result<Value> {
        let args = to_wire_value(&args).map_err(SluiceError::wrap)?;
        self.ensure_worker_fleet().await?;

        let session_id = Uuid::new_v4();
        let rx = {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return Err(SluiceError::shut_down());
            }
            if state.slots.is_empty() {
                return Err(SluiceError::no_workers());
            }

            let index = state.pick_slot();
            let request_id = Uuid::new_v4();
            let rx = state.register_pending(request_id, Some(session_id));
            state.slots[index].busy = true;
            if let Err(e) = state.slots[index].handle.send(Request::SessionStart {
                request_id,
                session_id,
                task: Some(TaskCall {
                    task: name.to_string(),
                    args,
                }),
            }) {
                state.pending.remove(&request_id);
                state.slots[index].busy = false;
                return Err(SluiceError::from(e));
            }
            rx
        };

        await_reply(rx).await
    }

    /// Run a caller-side session body against a client pinned on one worker.
    ///
    /// The body receives a [`Session`] proxy whose queries all reach the
    /// same backend connection. The pinned client is released on every exit
    /// path, including a body error, and the proxy is invalid once this call
    /// returns.
    pub async fn session_with<T, F>(&self, body: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a Session) -> BoxFuture<'a, Result<T>>,
    {
        self.ensure_worker_fleet().await?;

        let session_id = Uuid::new_v4();
        let (worker, rx) = {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return Err(SluiceError::shut_down());
            }
            if state.slots.is_empty() {
                return Err(SluiceError::no_workers());
            }

            let index = state.pick_slot();
            let request_id = Uuid::new_v4();
            let rx = state.register_pending(request_id, Some(session_id));
            state.slots[index].busy = true;
            let worker = state.slots[index].handle.clone();
            if let Err(e) = worker.send(Request::SessionStart {
                request_id,
                session_id,
                task: None,
            }) {
                state.pending.remove(&request_id);
                state.slots[index].busy = false;
                return Err(SluiceError::from(e));
            }
            (worker, rx)
        };

        // Wait for the pin acknowledgement before exposing the proxy.
        await_reply(rx).await?;
        self.state
            .lock()
            .await
            .bindings
            .insert(session_id, worker.worker_id());

        let session = Session::new(session_id, worker.clone(), self.state.clone());
        let outcome = body(&session).await;
        session.release();
        self.state.lock().await.bindings.remove(&session_id);

        let end_result = self
            .finish_session(&worker, session_id, outcome.is_err())
            .await;

        match outcome {
            Ok(value) => {
                end_result?;
                Ok(value)
            }
            Err(err) => {
                if let Err(end_err) = end_result {
                    debug!(
                        session_id = %session_id,
                        error = %end_err,
                        "Session release after a failed body also failed"
                    );
                }
                Err(err)
            }
        }
    }

    /// Spawn the worker fleet ahead of the first worker-backed call.
    /// Idempotent; a no-op after `shutdown`.
    pub async fn warmup(&self) -> Result<()> {
        if self.state.lock().await.shut_down {
            return Ok(());
        }
        self.ensure_init().await
    }

    /// Tear the instance down: reject everything pending, terminate the
    /// worker fleet, and close the local pool. One-shot and idempotent;
    /// repeated calls are no-ops.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return;
            }
            state.shut_down = true;

            let pending: Vec<PendingRequest> =
                state.pending.drain().map(|(_, pending)| pending).collect();
            for entry in pending {
                let _ = entry.resolver.send(Err(SluiceError::shut_down()));
            }
            state.bindings.clear();
            state.slots.clear();
            state.cursor = 0;
        }

        self.transport.terminate_all().await;
        if let Some(pump) = self.pump.lock().await.take() {
            pump.abort();
        }
        self.local.close().await;
        info!("Sluice instance shut down");
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn ensure_worker_fleet(&self) -> Result<()> {
        if self.state.lock().await.shut_down {
            return Err(SluiceError::shut_down());
        }
        if self.plan.workers == 0 {
            return Err(SluiceError::no_workers());
        }
        self.ensure_init().await
    }

    /// Drive the shared one-shot initialization. Concurrent callers await
    /// the same attempt; a failed attempt is retried by the next caller.
    async fn ensure_init(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| self.initialize())
            .await
            .map(|_| ())
    }

    async fn initialize(&self) -> Result<()> {
        if self.state.lock().await.shut_down {
            return Ok(());
        }
        if self.plan.workers == 0 {
            return Ok(());
        }

        if let Some(inbound) = self.transport.take_inbound().await {
            let pump = spawn_reply_pump(self.state.clone(), inbound);
            *self.pump.lock().await = Some(pump);
        }

        let spawns = (0..self.plan.workers).map(|worker_id| self.transport.spawn(worker_id));
        let handles = futures::future::try_join_all(spawns)
            .await
            .map_err(SluiceError::from)?;

        let mut state = self.state.lock().await;
        state.slots = handles
            .into_iter()
            .map(|handle| WorkerSlot {
                handle,
                busy: false,
            })
            .collect();
        info!(workers = self.plan.workers, "Worker fleet online");
        Ok(())
    }

    async fn finish_session(
        &self,
        worker: &WorkerHandle,
        session_id: Uuid,
        failed: bool,
    ) -> Result<()> {
        let rx = {
            let mut state = self.state.lock().await;
            if state.shut_down {
                return Err(SluiceError::shut_down());
            }

            let request_id = Uuid::new_v4();
            let rx = state.register_pending(request_id, Some(session_id));
            if let Some(slot) = state.slot_mut(worker.worker_id()) {
                slot.busy = true;
            }
            if let Err(e) = worker.send(Request::SessionEnd {
                request_id,
                session_id,
                failed,
            }) {
                state.pending.remove(&request_id);
                if let Some(slot) = state.slot_mut(worker.worker_id()) {
                    slot.busy = false;
                }
                return Err(SluiceError::from(e));
            }
            rx
        };

        await_reply(rx).await.map(|_| ())
    }
}

/// Wait for the correlated reply. A dropped resolver means the pending table
/// was drained by `shutdown`.
async fn await_reply(rx: oneshot::Receiver<Result<Value>>) -> Result<Value> {
    rx.await.map_err(|_| SluiceError::shut_down())?
}

/// Consume the inbound reply stream: clear the busy flag of the answering
/// worker, then resolve the matching pending entry.
fn spawn_reply_pump(
    state: Arc<Mutex<DispatcherState>>,
    mut inbound: tokio::sync::mpsc::UnboundedReceiver<Reply>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(reply) = inbound.recv().await {
            let mut state = state.lock().await;
            if let Some(slot) = state.slot_mut(reply.worker_id) {
                slot.busy = false;
            }
            match state.pending.remove(&reply.request_id) {
                Some(pending) => {
                    let result = match reply.outcome {
                        Outcome::Ok { data } => Ok(data),
                        Outcome::Err { error } => Err(SluiceError::from_wire(error)),
                    };
                    if pending.resolver.send(result).is_err() {
                        debug!(
                            request_id = %reply.request_id,
                            "Requester no longer waiting for reply"
                        );
                    }
                }
                None => debug!(
                    request_id = %reply.request_id,
                    "Reply with no pending entry"
                ),
            }
        }
        debug!("Reply pump stopped");
    })
}
