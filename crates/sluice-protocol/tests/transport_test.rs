// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport integration tests: several workers sharing one reply stream.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use sluice_protocol::transport::{ChannelTransport, Transport, WorkerContext};
use sluice_protocol::{Reply, Request};

/// Worker body that replies to every task with its own worker id and the
/// request's args, after an optional per-worker delay to shuffle reply order.
fn tagging_body(context: WorkerContext) {
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
                        // Workers with higher ids answer later.
                        tokio::time::sleep(Duration::from_millis(u64::from(worker_id) * 10)).await;
                        let _ = replies.send(Reply::ok(
                            request_id,
                            worker_id,
                            json!({ "worker": worker_id, "args": args }),
                        ));
                    }
                    Some(_) => {}
                    None => break,
                },
            }
        }
    });
}

#[tokio::test]
async fn test_replies_correlate_across_workers() {
    let transport = ChannelTransport::new(tagging_body);
    let mut inbound = transport.take_inbound().await.unwrap();

    let mut handles = Vec::new();
    for worker_id in 0..3 {
        handles.push(transport.spawn(worker_id).await.unwrap());
    }

    // One request per worker; replies arrive out of send order because of
    // the per-worker delays.
    let mut sent: HashMap<Uuid, u32> = HashMap::new();
    for handle in handles.iter().rev() {
        let request_id = Uuid::new_v4();
        sent.insert(request_id, handle.worker_id());
        handle
            .send(Request::Task {
                request_id,
                task: "tag".to_string(),
                args: json!(handle.worker_id()),
            })
            .unwrap();
    }

    for _ in 0..sent.len() {
        let reply = inbound.recv().await.unwrap();
        let expected_worker = sent.remove(&reply.request_id).unwrap();
        assert_eq!(reply.worker_id, expected_worker);
    }
    assert!(sent.is_empty());

    transport.terminate_all().await;
}

#[tokio::test]
async fn test_terminated_worker_leaves_others_running() {
    let transport = ChannelTransport::new(tagging_body);
    let mut inbound = transport.take_inbound().await.unwrap();

    let first = transport.spawn(0).await.unwrap();
    let second = transport.spawn(1).await.unwrap();

    transport.terminate(0).await;
    assert!(first
        .send(Request::Task {
            request_id: Uuid::new_v4(),
            task: "tag".to_string(),
            args: json!(null),
        })
        .is_err());

    let request_id = Uuid::new_v4();
    second
        .send(Request::Task {
            request_id,
            task: "tag".to_string(),
            args: json!(null),
        })
        .unwrap();
    let reply = inbound.recv().await.unwrap();
    assert_eq!(reply.request_id, request_id);
    assert_eq!(reply.worker_id, 1);

    transport.terminate_all().await;
}

#[tokio::test]
async fn test_respawn_after_terminate() {
    let transport = ChannelTransport::new(tagging_body);
    let mut inbound = transport.take_inbound().await.unwrap();

    let handle = transport.spawn(5).await.unwrap();
    transport.terminate(5).await;

    // The same worker id can be spawned again after termination.
    let handle = {
        drop(handle);
        transport.spawn(5).await.unwrap()
    };

    let request_id = Uuid::new_v4();
    handle
        .send(Request::Task {
            request_id,
            task: "tag".to_string(),
            args: json!("again"),
        })
        .unwrap();
    let reply = inbound.recv().await.unwrap();
    assert_eq!(reply.request_id, request_id);
    assert!(reply.is_ok());

    transport.terminate_all().await;
}
