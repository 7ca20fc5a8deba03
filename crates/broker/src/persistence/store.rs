//! TaskStore trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::add;
use crate::config::RequeueHistory;
use crate::reliability::{FailureCause, RetryDecider, RetryDecision};
use crate::state::{TaskEvent, TaskStatus, TransitionError};

/// Task identifier (UUID v7, assigned at enqueue)
pub type TaskId = Uuid;

/// Per-claim credential (UUID v4, minted on every successful claim)
pub type LeaseToken = Uuid;

/// Identifier of a dead-letter entry
pub type DeadLetterId = Uuid;

/// Error summary recorded when the reaper reclaims an abandoned lease
pub const LEASE_EXPIRED_SUMMARY: &str = "lease expired";

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store could not be reached or the query failed
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A persisted value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Dead-letter entry not found (or archived)
    #[error("dead letter not found: {0}")]
    DeadLetterNotFound(DeadLetterId),

    /// An active task already holds the dedupe key
    #[error("dedupe key is held by active task {existing}")]
    DedupeConflict { existing: TaskId },

    /// A transition outside the lifecycle table was attempted
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

impl StoreError {
    /// Whether the caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Namespaced dedupe key
///
/// `scope` is the queue name for per-queue deduplication, or
/// [`DedupeKey::GLOBAL_SCOPE`] when keys are unique across queues.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DedupeKey {
    pub scope: String,
    pub key: String,
}

impl DedupeKey {
    /// Scope shared by every queue
    pub const GLOBAL_SCOPE: &'static str = "*";

    pub fn new(scope: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
        }
    }
}

/// One failed attempt, kept for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub attempt: u32,
    pub error_summary: String,
    pub at: DateTime<Utc>,
}

/// A task record as held by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub queue: String,
    pub payload: Vec<u8>,
    pub dedupe_key: Option<DedupeKey>,
    pub status: TaskStatus,
    pub available_at: DateTime<Utc>,
    pub lease_token: Option<LeaseToken>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub attempt: u32,
    pub max_attempts: u32,
    pub failure_history: Vec<FailureRecord>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Whether `claim` may hand this task out at `now`
    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_claimable() && self.available_at <= now
    }

    /// Whether `token` is the current, unexpired lease at `now`
    pub fn holds_lease(&self, token: LeaseToken, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Leased
            && self.lease_token == Some(token)
            && self.lease_expiry.is_some_and(|expiry| now <= expiry)
    }

    /// Whether the lease ran out strictly before `now`
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Leased && self.lease_expiry.is_some_and(|expiry| expiry < now)
    }

    /// Take the next lease: mints a token and counts the attempt
    pub(crate) fn lease(
        &mut self,
        token: LeaseToken,
        lease_duration: Duration,
        now: DateTime<Utc>,
    ) -> Result<LeasedTask, TransitionError> {
        self.status = self.status.apply(TaskEvent::Claim)?;
        let expiry = add(now, lease_duration);
        self.lease_token = Some(token);
        self.lease_expiry = Some(expiry);
        self.attempt = self.attempt.saturating_add(1);

        Ok(LeasedTask {
            id: self.id,
            queue: self.queue.clone(),
            payload: self.payload.clone(),
            attempt: self.attempt,
            max_attempts: self.max_attempts,
            lease_token: token,
            lease_expiry: expiry,
        })
    }

    /// Record a failed attempt and move to the state the retry engine picks
    ///
    /// The caller must already hold the record exclusively and must have
    /// checked the lease. On [`FailureResolution::DeadLetter`] the record is
    /// left `DeadLettered` and the caller moves it to the dead-letter
    /// namespace.
    pub(crate) fn resolve_failure(
        &mut self,
        failure: &Failure,
        cause: FailureCause,
        decider: &dyn RetryDecider,
        now: DateTime<Utc>,
    ) -> Result<FailureResolution, TransitionError> {
        let (event, delay) = if !failure.retryable {
            (TaskEvent::PermanentFailure, None)
        } else {
            match decider.decide(&self.queue, self.attempt, self.max_attempts, cause) {
                RetryDecision::Retry { delay } => match cause {
                    FailureCause::Nack => (TaskEvent::RetryableFailure, Some(delay)),
                    FailureCause::LeaseExpired => (TaskEvent::LeaseExpired, Some(delay)),
                },
                RetryDecision::Exhausted => (TaskEvent::AttemptsExhausted, None),
            }
        };

        self.status = self.status.apply(event)?;
        self.failure_history.push(FailureRecord {
            attempt: self.attempt,
            error_summary: failure.error_summary.clone(),
            at: now,
        });
        self.lease_token = None;
        self.lease_expiry = None;

        match delay {
            Some(delay) => {
                self.available_at = add(now, delay);
                Ok(FailureResolution::Retry {
                    available_at: self.available_at,
                    delay,
                })
            }
            None if event == TaskEvent::PermanentFailure => {
                Ok(FailureResolution::DeadLetter(DeadLetterReason::PermanentFailure))
            }
            None => Ok(FailureResolution::DeadLetter(
                DeadLetterReason::AttemptsExhausted,
            )),
        }
    }
}

/// Where a failed attempt leads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureResolution {
    Retry {
        available_at: DateTime<Utc>,
        delay: Duration,
    },
    DeadLetter(DeadLetterReason),
}

/// Definition of a task to be enqueued
#[derive(Debug, Clone)]
pub struct NewTask {
    pub queue: String,
    pub payload: Vec<u8>,
    /// Initial visibility delay; `available_at = now + delay`
    pub delay: Duration,
    pub dedupe_key: Option<DedupeKey>,
    pub max_attempts: u32,
}

/// Result of an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new task was inserted
    Created(TaskId),

    /// An active task already held the dedupe key; this is its id
    Duplicate(TaskId),
}

impl EnqueueOutcome {
    pub fn id(&self) -> TaskId {
        match self {
            Self::Created(id) | Self::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// A task handed to a worker under a lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeasedTask {
    pub id: TaskId,
    pub queue: String,
    pub payload: Vec<u8>,
    /// Claim number of this lease (1 on first delivery)
    pub attempt: u32,
    pub max_attempts: u32,
    pub lease_token: LeaseToken,
    pub lease_expiry: DateTime<Utc>,
}

/// Result of a lease-guarded operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    /// The lease was valid and the operation took effect
    Applied,

    /// The lease expired or was superseded; nothing changed
    InvalidLease,
}

impl LeaseStatus {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// A worker-reported failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub retryable: bool,
    pub error_summary: String,
}

impl Failure {
    pub fn retryable(summary: impl Into<String>) -> Self {
        Self {
            retryable: true,
            error_summary: summary.into(),
        }
    }

    pub fn permanent(summary: impl Into<String>) -> Self {
        Self {
            retryable: false,
            error_summary: summary.into(),
        }
    }
}

/// Outcome of a nack or of reclaiming an expired lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The task will become visible again at `available_at`
    Retrying {
        available_at: DateTime<Utc>,
        delay: Duration,
    },

    /// The task was moved to the dead-letter queue
    DeadLettered { dlq_id: DeadLetterId },

    /// The lease expired or was superseded; nothing changed
    InvalidLease,
}

/// A task reclaimed by the lease reaper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapedTask {
    pub task_id: TaskId,
    pub queue: String,
    pub outcome: NackOutcome,
}

/// Why a task was dead-lettered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    PermanentFailure,
    AttemptsExhausted,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermanentFailure => "permanent_failure",
            Self::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

impl std::str::FromStr for DeadLetterReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permanent_failure" => Ok(Self::PermanentFailure),
            "attempts_exhausted" => Ok(Self::AttemptsExhausted),
            other => Err(format!("unknown dead letter reason: {}", other)),
        }
    }
}

/// Dead letter queue entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: DeadLetterId,
    pub task_id: TaskId,
    pub queue: String,
    pub payload: Vec<u8>,
    pub dedupe_key: Option<DedupeKey>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub failure_history: Vec<FailureRecord>,
    pub reason: DeadLetterReason,
    pub created_at: DateTime<Utc>,
    pub dead_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl DeadLetterEntry {
    /// The most recent failure summary, if any
    pub fn last_error(&self) -> Option<&str> {
        self.failure_history
            .last()
            .map(|f| f.error_summary.as_str())
    }
}

/// Filter for listing DLQ entries
#[derive(Debug, Clone, Default)]
pub struct DeadLetterFilter {
    pub queue: Option<String>,
    pub include_archived: bool,
}

impl DeadLetterFilter {
    pub fn queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            include_archived: false,
        }
    }
}

/// Pagination parameters
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Task counts for one queue
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    pub pending: u64,
    pub leased: u64,
    pub retry_scheduled: u64,
    /// Unarchived dead letters
    pub dead_lettered: u64,
}

/// Store for task records and the dead-letter namespace
///
/// This is the only place state transitions are applied. Implementations
/// must be thread-safe and mutate each task atomically (compare-and-set on
/// status and lease token, or a row lock); no lock may span all tasks.
#[async_trait]
pub trait TaskStore: Send + Sync + 'static {
    // =========================================================================
    // Task Operations
    // =========================================================================

    /// Insert a `Pending` task, or return the active task holding its dedupe key
    async fn enqueue(&self, task: NewTask) -> Result<EnqueueOutcome, StoreError>;

    /// Lease up to `batch_size` visible tasks of `queue`
    ///
    /// Tasks are taken in `(available_at, created_at)` order. Never waits for
    /// tasks to appear; returns an empty vector instead.
    async fn claim(
        &self,
        queue: &str,
        lease_duration: Duration,
        batch_size: usize,
    ) -> Result<Vec<LeasedTask>, StoreError>;

    /// Delete a task whose lease is still held by `token`
    async fn ack(&self, task_id: TaskId, token: LeaseToken) -> Result<LeaseStatus, StoreError>;

    /// Record a failure and reschedule or dead-letter the task
    async fn nack(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        failure: Failure,
        decider: &dyn RetryDecider,
    ) -> Result<NackOutcome, StoreError>;

    /// Push `lease_expiry` to `now + new_duration`
    async fn extend_lease(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        new_duration: Duration,
    ) -> Result<LeaseStatus, StoreError>;

    /// Reclaim up to `limit` leases that expired, as implicit retryable nacks
    async fn reap_expired_leases(
        &self,
        decider: &dyn RetryDecider,
        limit: usize,
    ) -> Result<Vec<ReapedTask>, StoreError>;

    /// Load an active task
    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Count tasks per status
    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, StoreError>;

    // =========================================================================
    // Dead Letter Queue Operations
    // =========================================================================

    /// List DLQ entries, most recent first
    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError>;

    /// Load a DLQ entry (archived entries included)
    async fn get_dead_letter(&self, id: DeadLetterId)
        -> Result<Option<DeadLetterEntry>, StoreError>;

    /// Move a DLQ entry back to its queue as a fresh `Pending` task
    async fn requeue_dead_letter(
        &self,
        id: DeadLetterId,
        history: RequeueHistory,
    ) -> Result<TaskId, StoreError>;

    /// Hide a DLQ entry for good, keeping it for audit
    async fn archive_dead_letter(&self, id: DeadLetterId) -> Result<(), StoreError>;

    /// Remove a DLQ entry
    async fn delete_dead_letter(&self, id: DeadLetterId) -> Result<(), StoreError>;
}
