//! Dead-letter router
//!
//! Tasks that failed permanently or ran out of attempts are moved out of
//! the active store into a separate namespace. They are never claimed again
//! until an operator requeues them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::config::RequeueHistory;
use crate::persistence::{
    DeadLetterEntry, DeadLetterFilter, DeadLetterId, DeadLetterReason, Pagination, StoreError,
    Task, TaskId, TaskStore,
};
use crate::state::{TaskEvent, TaskStatus, TransitionError};

/// Build the DLQ entry for a task that just reached `DeadLettered`
///
/// Payload, queue, dedupe key and failure history are carried over as-is.
pub fn escalate(task: &Task, reason: DeadLetterReason, now: DateTime<Utc>) -> DeadLetterEntry {
    DeadLetterEntry {
        id: Uuid::now_v7(),
        task_id: task.id,
        queue: task.queue.clone(),
        payload: task.payload.clone(),
        dedupe_key: task.dedupe_key.clone(),
        attempts: task.attempt,
        max_attempts: task.max_attempts,
        failure_history: task.failure_history.clone(),
        reason,
        created_at: task.created_at,
        dead_at: now,
        archived_at: None,
    }
}

/// Turn a DLQ entry back into a claimable task
///
/// The task keeps its original id and `created_at`, starts again at attempt
/// zero and is visible immediately.
pub fn revive(
    entry: DeadLetterEntry,
    history: RequeueHistory,
    now: DateTime<Utc>,
) -> Result<Task, TransitionError> {
    let status = TaskStatus::DeadLettered.apply(TaskEvent::Requeue)?;
    let failure_history = match history {
        RequeueHistory::Clear => Vec::new(),
        RequeueHistory::Retain => entry.failure_history,
    };

    Ok(Task {
        id: entry.task_id,
        queue: entry.queue,
        payload: entry.payload,
        dedupe_key: entry.dedupe_key,
        status,
        available_at: now,
        lease_token: None,
        lease_expiry: None,
        attempt: 0,
        max_attempts: entry.max_attempts,
        failure_history,
        created_at: entry.created_at,
    })
}

/// Operator surface over the dead-letter namespace
#[derive(Clone)]
pub struct DeadLetterRouter {
    store: Arc<dyn TaskStore>,
    history: RequeueHistory,
}

impl DeadLetterRouter {
    /// Create a router that requeues with the given history policy
    pub fn new(store: Arc<dyn TaskStore>, history: RequeueHistory) -> Self {
        Self { store, history }
    }

    /// Unarchived entries of `queue`, most recent first
    pub async fn list(
        &self,
        queue: &str,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.store
            .list_dead_letters(DeadLetterFilter::queue(queue), pagination)
            .await
    }

    /// Entries matching an arbitrary filter
    pub async fn list_filtered(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        self.store.list_dead_letters(filter, pagination).await
    }

    /// Load an entry, archived or not
    pub async fn get(&self, id: DeadLetterId) -> Result<Option<DeadLetterEntry>, StoreError> {
        self.store.get_dead_letter(id).await
    }

    /// Re-insert an entry as a `Pending` task in its original queue
    pub async fn requeue(&self, id: DeadLetterId) -> Result<TaskId, StoreError> {
        let task_id = self.store.requeue_dead_letter(id, self.history).await?;
        info!(dlq_id = %id, %task_id, "requeued dead letter");
        Ok(task_id)
    }

    /// Hide an entry permanently, keeping it for audit
    pub async fn archive(&self, id: DeadLetterId) -> Result<(), StoreError> {
        self.store.archive_dead_letter(id).await?;
        info!(dlq_id = %id, "archived dead letter");
        Ok(())
    }

    /// Remove an entry
    pub async fn delete(&self, id: DeadLetterId) -> Result<(), StoreError> {
        self.store.delete_dead_letter(id).await?;
        info!(dlq_id = %id, "deleted dead letter");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::FailureRecord;

    fn dead_task(now: DateTime<Utc>) -> Task {
        Task {
            id: Uuid::now_v7(),
            queue: "emails".to_string(),
            payload: b"hello".to_vec(),
            dedupe_key: None,
            status: TaskStatus::DeadLettered,
            available_at: now,
            lease_token: None,
            lease_expiry: None,
            attempt: 4,
            max_attempts: 3,
            failure_history: vec![FailureRecord {
                attempt: 4,
                error_summary: "smtp 550".to_string(),
                at: now,
            }],
            created_at: now - chrono::Duration::minutes(5),
        }
    }

    #[test]
    fn test_escalate_preserves_task_data() {
        let now = Utc::now();
        let task = dead_task(now);

        let entry = escalate(&task, DeadLetterReason::AttemptsExhausted, now);

        assert_eq!(entry.task_id, task.id);
        assert_eq!(entry.queue, "emails");
        assert_eq!(entry.payload, b"hello");
        assert_eq!(entry.attempts, 4);
        assert_eq!(entry.last_error(), Some("smtp 550"));
        assert_eq!(entry.archived_at, None);
    }

    #[test]
    fn test_revive_resets_attempts() {
        let now = Utc::now();
        let task = dead_task(now);
        let entry = escalate(&task, DeadLetterReason::PermanentFailure, now);

        let revived = revive(entry, RequeueHistory::Clear, now).unwrap();

        assert_eq!(revived.id, task.id);
        assert_eq!(revived.status, TaskStatus::Pending);
        assert_eq!(revived.attempt, 0);
        assert!(revived.failure_history.is_empty());
        assert_eq!(revived.created_at, task.created_at);
        assert!(revived.is_visible(now));
    }

    #[test]
    fn test_revive_can_retain_history() {
        let now = Utc::now();
        let entry = escalate(&dead_task(now), DeadLetterReason::PermanentFailure, now);

        let revived = revive(entry, RequeueHistory::Retain, now).unwrap();

        assert_eq!(revived.attempt, 0);
        assert_eq!(revived.failure_history.len(), 1);
    }
}
