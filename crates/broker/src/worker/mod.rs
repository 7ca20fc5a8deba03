//! Worker runtime
//!
//! This module provides:
//! - [`HandlerRegistry`] - Queue name to handler mapping
//! - [`TaskPoller`] - Leasing with exponential idle backoff
//! - [`WorkerPool`] - Concurrent execution with lease heartbeats
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                             │
//! │  ┌─────────────┐  ┌─────────────┐                           │
//! │  │ TaskPoller  │  │ TaskPoller  │   one per queue           │
//! │  │  (queue a)  │  │  (queue b)  │                           │
//! │  └──────┬──────┘  └──────┬──────┘                           │
//! │         └────────┬───────┘                                   │
//! │                  ▼                                           │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │         Task Executor (Semaphore-limited)           │    │
//! │  │  handler + lease heartbeat, then ack / nack         │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! A handler that outlives its lease without heartbeats is reclaimed by the
//! [`LeaseReaper`](crate::reaper::LeaseReaper) and may run again elsewhere,
//! so handlers must be idempotent.

mod poller;
mod pool;
mod registry;

pub use poller::{PollerConfig, TaskPoller};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use registry::{HandlerError, HandlerRegistry, HandlerResult, TaskHandler};
