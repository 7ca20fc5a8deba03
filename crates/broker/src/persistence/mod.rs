//! Persistence layer for the broker
//!
//! This module provides:
//! - [`TaskStore`] trait, the single owner of task state transitions
//! - [`InMemoryTaskStore`] for tests and single-process use
//! - [`PostgresTaskStore`] for durable, multi-node deployments

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use store::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterId, DeadLetterReason, DedupeKey, EnqueueOutcome,
    Failure, FailureRecord, LeaseStatus, LeaseToken, LeasedTask, NackOutcome, NewTask, Pagination,
    QueueStats, ReapedTask, StoreError, Task, TaskId, TaskStore, LEASE_EXPIRED_SUMMARY,
};
