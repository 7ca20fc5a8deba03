//! Broker facade
//!
//! The contract consumed by producers and workers. The facade owns no task
//! state: it validates requests, fills in per-queue defaults and hands
//! everything else to the [`TaskStore`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::config::{BrokerConfig, ConfigError, DedupeScope};
use crate::dlq::DeadLetterRouter;
use crate::persistence::{
    DeadLetterEntry, DeadLetterId, DedupeKey, EnqueueOutcome, Failure, LeaseStatus, LeaseToken,
    LeasedTask, NackOutcome, NewTask, Pagination, QueueStats, StoreError, Task, TaskId,
    TaskStore,
};
use crate::reaper::LeaseReaper;
use crate::reliability::RetryEngine;

/// Longest error summary kept per failure, in characters
pub const MAX_ERROR_SUMMARY_CHARS: usize = 4096;

/// A leased task as seen by a worker
pub type TaskHandle = LeasedTask;

/// Broker errors
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The request can never succeed as given
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration error
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BrokerError {
    /// Whether the caller may retry the operation unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_retryable())
    }
}

/// Optional enqueue parameters
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Time before the task first becomes visible
    pub delay: Duration,

    /// At most one active task per key (within the configured scope)
    pub dedupe_key: Option<String>,

    /// Attempt ceiling; the queue's policy when unset
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Reliable background task broker
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use deferq_broker::{Broker, BrokerConfig, EnqueueOptions, InMemoryTaskStore};
///
/// # #[tokio::main]
/// # async fn main() {
/// let broker = Broker::new(Arc::new(InMemoryTaskStore::new()), BrokerConfig::default()).unwrap();
///
/// let id = broker
///     .enqueue("emails", b"hello".to_vec(), EnqueueOptions::new())
///     .await
///     .unwrap();
///
/// let tasks = broker.lease("emails", Some(Duration::from_secs(30)), 1).await.unwrap();
/// assert_eq!(tasks[0].id, id);
///
/// broker.ack(tasks[0].id, tasks[0].lease_token).await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct Broker {
    store: Arc<dyn TaskStore>,
    config: Arc<BrokerConfig>,
    retry: Arc<RetryEngine>,
    dead_letters: DeadLetterRouter,
}

impl Broker {
    /// Create a broker over `store`
    pub fn new(store: Arc<dyn TaskStore>, config: BrokerConfig) -> Result<Self, BrokerError> {
        config.validate()?;

        let config = Arc::new(config);
        let retry = Arc::new(RetryEngine::new(config.clone()));
        let dead_letters = DeadLetterRouter::new(store.clone(), config.requeue_history);

        Ok(Self {
            store,
            config,
            retry,
            dead_letters,
        })
    }

    /// Broker configuration
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Dead-letter operations
    pub fn dead_letters(&self) -> &DeadLetterRouter {
        &self.dead_letters
    }

    /// A lease reaper sharing this broker's store and retry engine
    pub fn reaper(&self) -> LeaseReaper {
        LeaseReaper::new(
            self.store.clone(),
            self.retry.clone(),
            self.config.reaper_interval(),
            self.config.reaper_batch_size,
        )
    }

    // =========================================================================
    // Producer API
    // =========================================================================

    /// Add a task to `queue`
    ///
    /// With a dedupe key that an active task already holds, nothing is
    /// inserted and that task's id is returned.
    #[instrument(skip(self, payload, options))]
    pub async fn enqueue(
        &self,
        queue: &str,
        payload: impl Into<Vec<u8>>,
        options: EnqueueOptions,
    ) -> Result<TaskId, BrokerError> {
        let payload = payload.into();
        validate_queue(queue)?;
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.queue(queue).retry.max_attempts);
        if max_attempts == 0 {
            return Err(BrokerError::InvalidRequest(
                "max_attempts must be at least 1".to_string(),
            ));
        }

        let dedupe_key = match options.dedupe_key {
            Some(key) if key.is_empty() => {
                return Err(BrokerError::InvalidRequest(
                    "dedupe key must not be empty".to_string(),
                ))
            }
            Some(key) => Some(self.dedupe_key(queue, key)),
            None => None,
        };

        let outcome = self
            .store
            .enqueue(NewTask {
                queue: queue.to_string(),
                payload,
                delay: options.delay,
                dedupe_key,
                max_attempts,
            })
            .await?;

        if let EnqueueOutcome::Duplicate(existing) = outcome {
            debug!(%existing, "enqueue deduplicated");
        }
        Ok(outcome.id())
    }

    // =========================================================================
    // Worker API
    // =========================================================================

    /// Lease up to `batch_size` visible tasks of `queue`
    ///
    /// Returns immediately, possibly with no tasks. `None` uses the queue's
    /// default lease duration.
    #[instrument(skip(self))]
    pub async fn lease(
        &self,
        queue: &str,
        lease_duration: Option<Duration>,
        batch_size: usize,
    ) -> Result<Vec<TaskHandle>, BrokerError> {
        validate_queue(queue)?;
        if batch_size == 0 {
            return Err(BrokerError::InvalidRequest(
                "batch_size must be at least 1".to_string(),
            ));
        }
        let lease_duration =
            lease_duration.unwrap_or(self.config.queue(queue).default_lease_duration);
        validate_duration("lease_duration", lease_duration)?;

        Ok(self.store.claim(queue, lease_duration, batch_size).await?)
    }

    /// Report success; the task is removed
    #[instrument(skip(self, token))]
    pub async fn ack(&self, task_id: TaskId, token: LeaseToken) -> Result<LeaseStatus, BrokerError> {
        Ok(self.store.ack(task_id, token).await?)
    }

    /// Report failure
    ///
    /// A non-retryable failure dead-letters the task at once. A retryable
    /// one is rescheduled by the queue's retry policy, or dead-lettered when
    /// no attempts remain.
    #[instrument(skip(self, token, error_summary))]
    pub async fn nack(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        retryable: bool,
        error_summary: impl Into<String>,
    ) -> Result<NackOutcome, BrokerError> {
        let error_summary = truncate_summary(error_summary.into());
        let failure = Failure {
            retryable,
            error_summary,
        };

        Ok(self
            .store
            .nack(task_id, token, failure, self.retry.as_ref())
            .await?)
    }

    /// Push the lease deadline to `now + new_duration`
    #[instrument(skip(self, token))]
    pub async fn extend_lease(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        new_duration: Duration,
    ) -> Result<LeaseStatus, BrokerError> {
        validate_duration("new_duration", new_duration)?;
        Ok(self.store.extend_lease(task_id, token, new_duration).await?)
    }

    // =========================================================================
    // Operator API
    // =========================================================================

    /// Unarchived dead letters of `queue`, most recent first
    pub async fn list_dead_letters(&self, queue: &str) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        self.list_dead_letters_page(queue, Pagination::default())
            .await
    }

    /// One page of dead letters of `queue`
    pub async fn list_dead_letters_page(
        &self,
        queue: &str,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, BrokerError> {
        validate_queue(queue)?;
        Ok(self.dead_letters.list(queue, pagination).await?)
    }

    /// Load a dead letter, archived or not
    pub async fn get_dead_letter(
        &self,
        dlq_id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, BrokerError> {
        Ok(self.dead_letters.get(dlq_id).await?)
    }

    /// Move a dead letter back to its queue with a fresh attempt budget
    pub async fn requeue(&self, dlq_id: DeadLetterId) -> Result<TaskId, BrokerError> {
        Ok(self.dead_letters.requeue(dlq_id).await?)
    }

    /// Hide a dead letter permanently
    pub async fn archive(&self, dlq_id: DeadLetterId) -> Result<(), BrokerError> {
        Ok(self.dead_letters.archive(dlq_id).await?)
    }

    /// Remove a dead letter
    pub async fn delete_dead_letter(&self, dlq_id: DeadLetterId) -> Result<(), BrokerError> {
        Ok(self.dead_letters.delete(dlq_id).await?)
    }

    /// Task counts for `queue`
    pub async fn queue_stats(&self, queue: &str) -> Result<QueueStats, BrokerError> {
        validate_queue(queue)?;
        Ok(self.store.queue_stats(queue).await?)
    }

    /// Load an active task
    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, BrokerError> {
        Ok(self.store.get_task(task_id).await?)
    }

    fn dedupe_key(&self, queue: &str, key: String) -> DedupeKey {
        match self.config.dedupe_scope {
            DedupeScope::Queue => DedupeKey::new(queue, key),
            DedupeScope::Global => DedupeKey::new(DedupeKey::GLOBAL_SCOPE, key),
        }
    }
}

fn validate_queue(queue: &str) -> Result<(), BrokerError> {
    if queue.trim().is_empty() {
        return Err(BrokerError::InvalidRequest(
            "queue name must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_duration(name: &str, duration: Duration) -> Result<(), BrokerError> {
    if duration.is_zero() {
        return Err(BrokerError::InvalidRequest(format!(
            "{} must be positive",
            name
        )));
    }
    Ok(())
}

fn truncate_summary(mut summary: String) -> String {
    if let Some((cut, _)) = summary.char_indices().nth(MAX_ERROR_SUMMARY_CHARS) {
        summary.truncate(cut);
    }
    summary
}
