//! In-memory implementation of TaskStore

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use super::store::*;
use crate::clock::{add, Clock, SystemClock};
use crate::config::RequeueHistory;
use crate::dlq::{escalate, revive};
use crate::reliability::{FailureCause, RetryDecider};
use crate::state::{TaskEvent, TaskStatus};

/// A task plus its insertion order, used to break `created_at` ties
struct Record {
    seq: u64,
    task: Task,
}

/// In-memory implementation of TaskStore
///
/// Records live in sharded maps and every transition is a compare-and-set
/// on a single entry, so concurrent claimers contend only on the records
/// they race for. Nothing survives a restart; use it for tests and
/// single-process setups.
///
/// Lock order is dedupe index, then tasks. No code path holds a task entry
/// while touching the dedupe index.
///
/// # Example
///
/// ```
/// use deferq_broker::InMemoryTaskStore;
///
/// let store = InMemoryTaskStore::new();
/// assert_eq!(store.task_count(), 0);
/// ```
pub struct InMemoryTaskStore {
    clock: Arc<dyn Clock>,
    tasks: DashMap<TaskId, Record>,
    dedupe: DashMap<DedupeKey, TaskId>,
    dead_letters: DashMap<DeadLetterId, DeadLetterEntry>,
    seq: AtomicU64,
}

impl InMemoryTaskStore {
    /// Create a new in-memory store on the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a new in-memory store reading time from `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: DashMap::new(),
            dedupe: DashMap::new(),
            dead_letters: DashMap::new(),
            seq: AtomicU64::new(0),
        }
    }

    /// Number of active tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Number of DLQ entries, archived ones included
    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.dedupe.clear();
        self.tasks.clear();
        self.dead_letters.clear();
    }

    fn insert(&self, task: Task) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.tasks.insert(task.id, Record { seq, task });
    }

    fn is_active(&self, task_id: TaskId) -> bool {
        self.tasks
            .get(&task_id)
            .is_some_and(|record| record.task.status.is_active())
    }

    fn release_dedupe(&self, key: Option<&DedupeKey>, task_id: TaskId) {
        if let Some(key) = key {
            self.dedupe.remove_if(key, |_, holder| *holder == task_id);
        }
    }

    /// Count a failed attempt on `task_id` if `eligible` still holds
    fn fail(
        &self,
        task_id: TaskId,
        failure: &Failure,
        cause: FailureCause,
        decider: &dyn RetryDecider,
        now: DateTime<Utc>,
        eligible: impl FnOnce(&Task) -> bool,
    ) -> Result<NackOutcome, StoreError> {
        let entry = {
            let Some(mut record) = self.tasks.get_mut(&task_id) else {
                return Ok(NackOutcome::InvalidLease);
            };
            if !eligible(&record.task) {
                return Ok(NackOutcome::InvalidLease);
            }

            match record.task.resolve_failure(failure, cause, decider, now)? {
                FailureResolution::Retry {
                    available_at,
                    delay,
                } => {
                    debug!(%task_id, attempt = record.task.attempt, ?delay, "task scheduled for retry");
                    return Ok(NackOutcome::Retrying {
                        available_at,
                        delay,
                    });
                }
                FailureResolution::DeadLetter(reason) => escalate(&record.task, reason, now),
            }
        };

        // DeadLettered is not claimable, so the record is inert until removed
        self.tasks.remove(&task_id);
        self.release_dedupe(entry.dedupe_key.as_ref(), task_id);

        let dlq_id = entry.id;
        debug!(%task_id, %dlq_id, reason = entry.reason.as_str(), "task dead-lettered");
        self.dead_letters.insert(dlq_id, entry);

        Ok(NackOutcome::DeadLettered { dlq_id })
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, new: NewTask) -> Result<EnqueueOutcome, StoreError> {
        let now = self.clock.now();
        let task = Task {
            id: Uuid::now_v7(),
            queue: new.queue,
            payload: new.payload,
            dedupe_key: new.dedupe_key,
            status: TaskStatus::Pending,
            available_at: add(now, new.delay),
            lease_token: None,
            lease_expiry: None,
            attempt: 0,
            max_attempts: new.max_attempts,
            failure_history: Vec::new(),
            created_at: now,
        };
        let task_id = task.id;

        match task.dedupe_key.clone() {
            None => self.insert(task),
            Some(key) => match self.dedupe.entry(key) {
                Entry::Occupied(slot) if self.is_active(*slot.get()) => {
                    let existing = *slot.get();
                    debug!(%existing, "duplicate enqueue");
                    return Ok(EnqueueOutcome::Duplicate(existing));
                }
                Entry::Occupied(mut slot) => {
                    slot.insert(task_id);
                    self.insert(task);
                }
                Entry::Vacant(slot) => {
                    slot.insert(task_id);
                    self.insert(task);
                }
            },
        }

        debug!(%task_id, "enqueued task");
        Ok(EnqueueOutcome::Created(task_id))
    }

    async fn claim(
        &self,
        queue: &str,
        lease_duration: Duration,
        batch_size: usize,
    ) -> Result<Vec<LeasedTask>, StoreError> {
        if batch_size == 0 {
            return Ok(vec![]);
        }

        let now = self.clock.now();
        let mut candidates: Vec<_> = self
            .tasks
            .iter()
            .filter(|record| record.task.queue == queue && record.task.is_visible(now))
            .map(|record| {
                (
                    record.task.available_at,
                    record.task.created_at,
                    record.seq,
                    record.task.id,
                )
            })
            .collect();
        candidates.sort_unstable();

        let mut claimed = Vec::with_capacity(batch_size.min(candidates.len()));
        for (_, _, _, task_id) in candidates {
            if claimed.len() >= batch_size {
                break;
            }

            let Some(mut record) = self.tasks.get_mut(&task_id) else {
                continue;
            };
            // Lost the race to another claimer since the scan
            if !record.task.is_visible(now) {
                continue;
            }

            claimed.push(record.task.lease(Uuid::new_v4(), lease_duration, now)?);
        }

        if !claimed.is_empty() {
            debug!(queue, count = claimed.len(), "claimed tasks");
        }

        Ok(claimed)
    }

    async fn ack(&self, task_id: TaskId, token: LeaseToken) -> Result<LeaseStatus, StoreError> {
        let now = self.clock.now();
        let removed = self.tasks.remove_if(&task_id, |_, record| {
            record.task.holds_lease(token, now) && record.task.status.apply(TaskEvent::Ack).is_ok()
        });

        match removed {
            Some((_, record)) => {
                self.release_dedupe(record.task.dedupe_key.as_ref(), task_id);
                debug!(%task_id, "task acked");
                Ok(LeaseStatus::Applied)
            }
            None => {
                debug!(%task_id, "ack ignored: lease no longer held");
                Ok(LeaseStatus::InvalidLease)
            }
        }
    }

    async fn nack(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        failure: Failure,
        decider: &dyn RetryDecider,
    ) -> Result<NackOutcome, StoreError> {
        let now = self.clock.now();
        let outcome = self.fail(task_id, &failure, FailureCause::Nack, decider, now, |task| {
            task.holds_lease(token, now)
        })?;

        if outcome == NackOutcome::InvalidLease {
            debug!(%task_id, "nack ignored: lease no longer held");
        }
        Ok(outcome)
    }

    async fn extend_lease(
        &self,
        task_id: TaskId,
        token: LeaseToken,
        new_duration: Duration,
    ) -> Result<LeaseStatus, StoreError> {
        let now = self.clock.now();
        let Some(mut record) = self.tasks.get_mut(&task_id) else {
            return Ok(LeaseStatus::InvalidLease);
        };
        if !record.task.holds_lease(token, now) {
            debug!(%task_id, "extend ignored: lease no longer held");
            return Ok(LeaseStatus::InvalidLease);
        }

        record.task.lease_expiry = Some(add(now, new_duration));
        Ok(LeaseStatus::Applied)
    }

    async fn reap_expired_leases(
        &self,
        decider: &dyn RetryDecider,
        limit: usize,
    ) -> Result<Vec<ReapedTask>, StoreError> {
        let now = self.clock.now();
        let expired: Vec<(TaskId, String)> = self
            .tasks
            .iter()
            .filter(|record| record.task.lease_expired(now))
            .take(limit)
            .map(|record| (record.task.id, record.task.queue.clone()))
            .collect();

        let failure = Failure::retryable(LEASE_EXPIRED_SUMMARY);
        let mut reaped = Vec::with_capacity(expired.len());
        for (task_id, queue) in expired {
            let outcome = self.fail(
                task_id,
                &failure,
                FailureCause::LeaseExpired,
                decider,
                now,
                |task| task.lease_expired(now),
            )?;

            // Acked, nacked or extended since the scan
            if outcome == NackOutcome::InvalidLease {
                continue;
            }
            reaped.push(ReapedTask {
                task_id,
                queue,
                outcome,
            });
        }

        Ok(reaped)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.tasks.get(&task_id).map(|record| record.task.clone()))
    }

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, StoreError> {
        let mut stats = QueueStats {
            queue: queue.to_string(),
            ..Default::default()
        };

        for record in self.tasks.iter().filter(|r| r.task.queue == queue) {
            match record.task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Leased => stats.leased += 1,
                TaskStatus::RetryScheduled => stats.retry_scheduled += 1,
                TaskStatus::DeadLettered | TaskStatus::Acked => {}
            }
        }
        stats.dead_lettered = self
            .dead_letters
            .iter()
            .filter(|e| e.queue == queue && e.archived_at.is_none())
            .count() as u64;

        Ok(stats)
    }

    async fn list_dead_letters(
        &self,
        filter: DeadLetterFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let mut entries: Vec<DeadLetterEntry> = self
            .dead_letters
            .iter()
            .filter(|e| filter.queue.as_deref().map_or(true, |q| e.queue == q))
            .filter(|e| filter.include_archived || e.archived_at.is_none())
            .map(|e| e.value().clone())
            .collect();

        entries.sort_by(|a, b| b.dead_at.cmp(&a.dead_at).then_with(|| b.id.cmp(&a.id)));

        Ok(entries
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn get_dead_letter(
        &self,
        id: DeadLetterId,
    ) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(self.dead_letters.get(&id).map(|e| e.value().clone()))
    }

    async fn requeue_dead_letter(
        &self,
        id: DeadLetterId,
        history: RequeueHistory,
    ) -> Result<TaskId, StoreError> {
        let now = self.clock.now();
        let (_, entry) = self
            .dead_letters
            .remove_if(&id, |_, e| e.archived_at.is_none())
            .ok_or(StoreError::DeadLetterNotFound(id))?;
        let task_id = entry.task_id;

        match entry.dedupe_key.clone() {
            None => self.insert(revive(entry, history, now)?),
            Some(key) => match self.dedupe.entry(key) {
                Entry::Occupied(slot) if self.is_active(*slot.get()) => {
                    let existing = *slot.get();
                    drop(slot);
                    self.dead_letters.insert(id, entry);
                    return Err(StoreError::DedupeConflict { existing });
                }
                Entry::Occupied(mut slot) => {
                    slot.insert(task_id);
                    self.insert(revive(entry, history, now)?);
                }
                Entry::Vacant(slot) => {
                    slot.insert(task_id);
                    self.insert(revive(entry, history, now)?);
                }
            },
        }

        debug!(dlq_id = %id, %task_id, "requeued dead letter");
        Ok(task_id)
    }

    async fn archive_dead_letter(&self, id: DeadLetterId) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut entry = self
            .dead_letters
            .get_mut(&id)
            .filter(|e| e.archived_at.is_none())
            .ok_or(StoreError::DeadLetterNotFound(id))?;

        entry.archived_at = Some(now);
        Ok(())
    }

    async fn delete_dead_letter(&self, id: DeadLetterId) -> Result<(), StoreError> {
        self.dead_letters
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::DeadLetterNotFound(id))
    }
}
