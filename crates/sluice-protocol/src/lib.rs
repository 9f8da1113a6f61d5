// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message layer shared by the sluice dispatcher and its workers.
//!
//! This crate defines the three pieces that cross the dispatcher/worker
//! boundary:
//! - [`envelope`]: tagged request/reply messages with request-id correlation
//!   and worker-id tagging
//! - [`codec`]: the value-only payload boundary (everything that crosses is a
//!   plain JSON value, validated before sending)
//! - [`transport`]: the transport adapter trait plus the in-process
//!   implementation that runs each worker on a dedicated OS thread

pub mod codec;
pub mod envelope;
pub mod transport;

pub use codec::{from_wire_value, to_wire_value, CodecError};
pub use envelope::{Outcome, QuerySpec, Reply, Request, TaskCall, WireError, WorkerId};
pub use transport::{ChannelTransport, Transport, TransportError, WorkerContext, WorkerHandle};
