//! Broker behaviour against the in-memory store
//!
//! Time is driven by a `ManualClock`, so every lease and backoff boundary is
//! checked exactly.

use std::sync::Arc;
use std::time::Duration;

use deferq_broker::clock::ManualClock;
use deferq_broker::config::{BrokerConfig, QueueConfig};
use deferq_broker::persistence::{DeadLetterReason, InMemoryTaskStore, LeaseStatus, NackOutcome};
use deferq_broker::reliability::RetryPolicy;
use deferq_broker::{Broker, EnqueueOptions, TaskStatus};

const LEASE: Duration = Duration::from_secs(2);
const REAPER_INTERVAL: Duration = Duration::from_secs(1);

struct Harness {
    clock: ManualClock,
    store: Arc<InMemoryTaskStore>,
    broker: Broker,
}

fn harness(retry: RetryPolicy) -> Harness {
    let clock = ManualClock::new();
    let store = Arc::new(InMemoryTaskStore::with_clock(Arc::new(clock.clone())));
    let config = BrokerConfig::new().with_rng_seed(7).with_defaults(
        QueueConfig::new()
            .with_lease_duration(LEASE)
            .with_reaper_interval(REAPER_INTERVAL)
            .with_retry(retry),
    );
    let broker = Broker::new(store.clone(), config).unwrap();
    Harness {
        clock,
        store,
        broker,
    }
}

fn no_jitter(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::exponential()
        .with_max_attempts(max_attempts)
        .with_base_delay(Duration::from_secs(1))
        .with_backoff_multiplier(5.0)
        .with_max_delay(Duration::from_secs(3600))
        .with_jitter_fraction(0.0)
}

#[test_log::test(tokio::test)]
async fn test_valid_lease_is_never_handed_out_twice() {
    let h = harness(no_jitter(3));
    let id = h
        .broker
        .enqueue("jobs", b"work".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    let first = h.broker.lease("jobs", None, 10).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, id);

    // Right up to the expiry instant the lease still holds
    h.clock.advance(LEASE);
    assert!(h.broker.lease("jobs", None, 10).await.unwrap().is_empty());
    h.broker.reaper().run_once().await.unwrap();
    assert!(h.broker.lease("jobs", None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_abandoned_task_is_redelivered_and_acked() {
    let h = harness(no_jitter(3));
    let id = h
        .broker
        .enqueue("jobs", b"work".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    // First worker crashes
    let lost = h.broker.lease("jobs", None, 1).await.unwrap();
    assert_eq!(lost[0].attempt, 1);

    h.clock.advance(LEASE + REAPER_INTERVAL);
    let report = h.broker.reaper().run_once().await.unwrap();
    assert_eq!(report.reclaimed, 1);

    let retry = h.broker.lease("jobs", None, 1).await.unwrap();
    assert_eq!(retry.len(), 1);
    assert_eq!(retry[0].id, id);
    assert_eq!(retry[0].attempt, 2);

    let status = h.broker.ack(id, retry[0].lease_token).await.unwrap();
    assert_eq!(status, LeaseStatus::Applied);
    assert!(h.broker.get_task(id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_retryable_nacks_back_off_then_dead_letter() {
    let h = harness(no_jitter(3));
    let id = h
        .broker
        .enqueue("jobs", b"work".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    let mut delays = Vec::new();
    for attempt in 1..=3 {
        let leased = h.broker.lease("jobs", None, 1).await.unwrap();
        assert_eq!(leased.len(), 1, "attempt {attempt} should be claimable");
        assert_eq!(leased[0].attempt, attempt);

        let outcome = h
            .broker
            .nack(id, leased[0].lease_token, true, format!("boom {attempt}"))
            .await
            .unwrap();
        let NackOutcome::Retrying { delay, .. } = outcome else {
            panic!("attempt {attempt} should be retried, got {outcome:?}");
        };
        delays.push(delay);

        // Not visible before the backoff elapses
        h.clock.advance(delay - Duration::from_millis(1));
        assert!(h.broker.lease("jobs", None, 1).await.unwrap().is_empty());
        h.clock.advance(Duration::from_millis(1));
    }

    assert_eq!(
        delays,
        vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(25)
        ]
    );

    let leased = h.broker.lease("jobs", None, 1).await.unwrap();
    assert_eq!(leased[0].attempt, 4);
    let outcome = h
        .broker
        .nack(id, leased[0].lease_token, true, "boom 4")
        .await
        .unwrap();
    assert!(matches!(outcome, NackOutcome::DeadLettered { .. }));

    let entries = h.broker.list_dead_letters("jobs").await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task_id, id);
    assert_eq!(entries[0].reason, DeadLetterReason::AttemptsExhausted);
    assert_eq!(entries[0].failure_history.len(), 4);
    assert_eq!(entries[0].last_error(), Some("boom 4"));
    assert!(h.broker.lease("jobs", None, 1).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_permanent_nack_skips_remaining_attempts() {
    let h = harness(no_jitter(5));
    let id = h
        .broker
        .enqueue("jobs", b"work".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    let leased = h.broker.lease("jobs", None, 1).await.unwrap();
    let outcome = h
        .broker
        .nack(id, leased[0].lease_token, false, "malformed payload")
        .await
        .unwrap();

    let NackOutcome::DeadLettered { dlq_id } = outcome else {
        panic!("expected dead letter, got {outcome:?}");
    };
    let entry = h.broker.get_dead_letter(dlq_id).await.unwrap().unwrap();
    assert_eq!(entry.reason, DeadLetterReason::PermanentFailure);
    assert_eq!(entry.payload, b"work");
    assert_eq!(entry.queue, "jobs");
}

#[tokio::test]
async fn test_expired_lease_becomes_visible_within_one_reaper_interval() {
    let h = harness(no_jitter(3));
    h.broker
        .enqueue("jobs", b"work".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();
    h.broker.lease("jobs", Some(LEASE), 1).await.unwrap();

    // A reaper pass just before expiry leaves the task alone
    h.clock.advance(LEASE - Duration::from_millis(1));
    assert_eq!(h.broker.reaper().run_once().await.unwrap().total(), 0);
    assert!(h.broker.lease("jobs", None, 1).await.unwrap().is_empty());

    // The next pass, one interval later, reclaims it
    h.clock.advance(REAPER_INTERVAL);
    assert_eq!(h.broker.reaper().run_once().await.unwrap().reclaimed, 1);
    assert_eq!(h.broker.lease("jobs", None, 1).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_extend_lease_keeps_task_away_from_reaper() {
    let h = harness(no_jitter(3));
    let id = h
        .broker
        .enqueue("jobs", b"work".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();
    let leased = h.broker.lease("jobs", None, 1).await.unwrap();
    let token = leased[0].lease_token;

    h.clock.advance(Duration::from_secs(1));
    let status = h
        .broker
        .extend_lease(id, token, Duration::from_secs(10))
        .await
        .unwrap();
    assert!(status.is_applied());

    h.clock.advance(Duration::from_secs(5));
    assert_eq!(h.broker.reaper().run_once().await.unwrap().total(), 0);

    let task = h.broker.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Leased);
    assert_eq!(task.attempt, 1);
    assert!(h.broker.ack(id, token).await.unwrap().is_applied());
}

#[tokio::test]
async fn test_dedupe_key_is_released_after_ack() {
    let h = harness(no_jitter(3));
    let options = || EnqueueOptions::new().with_dedupe_key("order-42");

    let first = h.broker.enqueue("jobs", b"a".to_vec(), options()).await.unwrap();
    let again = h.broker.enqueue("jobs", b"b".to_vec(), options()).await.unwrap();
    assert_eq!(first, again);

    let leased = h.broker.lease("jobs", None, 1).await.unwrap();
    let while_leased = h.broker.enqueue("jobs", b"c".to_vec(), options()).await.unwrap();
    assert_eq!(first, while_leased);
    assert_eq!(h.store.task_count(), 1);

    h.broker.ack(first, leased[0].lease_token).await.unwrap();
    let fresh = h.broker.enqueue("jobs", b"d".to_vec(), options()).await.unwrap();
    assert_ne!(first, fresh);
}

#[tokio::test]
async fn test_requeue_resets_attempts() {
    let h = harness(no_jitter(3));
    let id = h
        .broker
        .enqueue("jobs", b"work".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();
    let leased = h.broker.lease("jobs", None, 1).await.unwrap();
    let NackOutcome::DeadLettered { dlq_id } = h
        .broker
        .nack(id, leased[0].lease_token, false, "bad")
        .await
        .unwrap()
    else {
        panic!("expected dead letter");
    };

    let revived = h.broker.requeue(dlq_id).await.unwrap();
    let task = h.broker.get_task(revived).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt, 0);
    assert_eq!(task.queue, "jobs");
    assert!(task.failure_history.is_empty());
    assert!(h.broker.list_dead_letters("jobs").await.unwrap().is_empty());

    let leased = h.broker.lease("jobs", None, 1).await.unwrap();
    assert_eq!(leased[0].attempt, 1);
    assert_eq!(leased[0].payload, b"work");
}

#[tokio::test]
async fn test_stale_token_cannot_touch_reclaimed_task() {
    let h = harness(no_jitter(3));
    let id = h
        .broker
        .enqueue("jobs", b"work".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    let slow = h.broker.lease("jobs", None, 1).await.unwrap();
    h.clock.advance(LEASE + Duration::from_millis(1));
    h.broker.reaper().run_once().await.unwrap();
    let fast = h.broker.lease("jobs", None, 1).await.unwrap();
    assert_eq!(fast[0].attempt, 2);

    let stale = slow[0].lease_token;
    assert_eq!(
        h.broker.ack(id, stale).await.unwrap(),
        LeaseStatus::InvalidLease
    );
    assert_eq!(
        h.broker.nack(id, stale, false, "late").await.unwrap(),
        NackOutcome::InvalidLease
    );
    assert_eq!(
        h.broker
            .extend_lease(id, stale, Duration::from_secs(60))
            .await
            .unwrap(),
        LeaseStatus::InvalidLease
    );

    let task = h.broker.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Leased);
    assert_eq!(task.lease_token, Some(fast[0].lease_token));
    assert_eq!(task.failure_history.len(), 1);
    assert_eq!(h.store.dead_letter_count(), 0);

    // A repeated ack after success is also absorbed
    let token = fast[0].lease_token;
    assert!(h.broker.ack(id, token).await.unwrap().is_applied());
    assert_eq!(
        h.broker.ack(id, token).await.unwrap(),
        LeaseStatus::InvalidLease
    );
}

#[tokio::test]
async fn test_delayed_task_ordering_within_queue() {
    let h = harness(no_jitter(3));
    let late = h
        .broker
        .enqueue(
            "jobs",
            b"late".to_vec(),
            EnqueueOptions::new().with_delay(Duration::from_secs(10)),
        )
        .await
        .unwrap();
    let first = h
        .broker
        .enqueue("jobs", b"first".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();
    let second = h
        .broker
        .enqueue("jobs", b"second".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    let ids: Vec<_> = h
        .broker
        .lease("jobs", None, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec![first, second]);

    h.clock.advance(Duration::from_secs(10));
    let leased = h.broker.lease("jobs", None, 10).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].id, late);
}

#[tokio::test]
async fn test_queue_stats_track_each_state() {
    let h = harness(no_jitter(3));
    for _ in 0..4 {
        h.broker
            .enqueue("jobs", b"work".to_vec(), EnqueueOptions::new())
            .await
            .unwrap();
    }
    let leased = h.broker.lease("jobs", None, 3).await.unwrap();
    h.broker
        .nack(leased[0].id, leased[0].lease_token, true, "retry")
        .await
        .unwrap();
    h.broker
        .nack(leased[1].id, leased[1].lease_token, false, "fatal")
        .await
        .unwrap();

    let stats = h.broker.queue_stats("jobs").await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.leased, 1);
    assert_eq!(stats.retry_scheduled, 1);
    assert_eq!(stats.dead_lettered, 1);
}
