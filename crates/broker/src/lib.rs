//! # deferq broker
//!
//! A reliable background task broker: producers enqueue deferred work,
//! workers lease it for a bounded time, and every task is eventually acked
//! or dead-lettered, whatever happens to the workers in between.
//!
//! ## Features
//!
//! - **Atomic claims**: a task is held by at most one valid lease at a time
//! - **Visibility timeouts**: abandoned leases are reclaimed by the [`LeaseReaper`]
//! - **Automatic retries**: per-queue exponential backoff with jitter
//! - **Dead-letter queue**: permanently failed tasks kept for manual replay
//! - **Pluggable storage**: in-memory for tests, PostgreSQL for durability
//!
//! Delivery is at-least-once. Handlers must tolerate running twice.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Broker                               │
//! │  (enqueue, lease, ack, nack, extend_lease, DLQ operations)  │
//! └─────────────────────────────────────────────────────────────┘
//!           │                    │                    │
//!           ▼                    ▼                    ▼
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │   RetryEngine    │ │ DeadLetterRouter │ │   LeaseReaper    │
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//!           │                    │                    │
//!           ▼                    ▼                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskStore                             │
//! │  (the only owner of task state; transitions per TaskStatus) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use deferq_broker::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), BrokerError> {
//! let broker = Broker::new(Arc::new(InMemoryTaskStore::new()), BrokerConfig::default())?;
//!
//! let id = broker.enqueue("emails", b"hello".to_vec(), EnqueueOptions::new()).await?;
//!
//! let tasks = broker.lease("emails", None, 1).await?;
//! assert_eq!(tasks[0].id, id);
//! assert!(broker.ack(id, tasks[0].lease_token).await?.is_applied());
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod clock;
pub mod config;
pub mod dlq;
pub mod persistence;
pub mod reaper;
pub mod reliability;
pub(crate) mod serde_util;
pub mod state;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::broker::{Broker, BrokerError, EnqueueOptions, TaskHandle};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::{BrokerConfig, DedupeScope, QueueConfig, RequeueHistory};
    pub use crate::persistence::{
        DeadLetterEntry, InMemoryTaskStore, LeaseStatus, NackOutcome, PostgresTaskStore,
        StoreError, TaskId, TaskStore,
    };
    pub use crate::reaper::{LeaseReaper, ReaperHandle};
    pub use crate::reliability::RetryPolicy;
    pub use crate::state::TaskStatus;
    pub use crate::worker::{
        HandlerError, HandlerRegistry, WorkerPool, WorkerPoolConfig, WorkerPoolError,
    };
}

// Re-export key types at crate root
pub use broker::{Broker, BrokerError, EnqueueOptions, TaskHandle};
pub use config::{BrokerConfig, ConfigError, QueueConfig};
pub use dlq::DeadLetterRouter;
pub use persistence::{InMemoryTaskStore, PostgresTaskStore, StoreError, TaskStore};
pub use reaper::{LeaseReaper, ReapReport, ReaperHandle};
pub use reliability::{RetryEngine, RetryPolicy};
pub use state::{TaskEvent, TaskStatus, TransitionError};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
