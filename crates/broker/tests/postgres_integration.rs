//! Integration tests for PostgresTaskStore
//!
//! Run with: cargo test -p deferq-broker --test postgres_integration
//!
//! Requirements:
//! - PostgreSQL reachable through DATABASE_URL; tests are skipped when unset
//! - Migrations are applied by the tests themselves
//!
//! Every test uses its own queue name, so they can share one database.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use uuid::Uuid;

use deferq_broker::clock::ManualClock;
use deferq_broker::config::{BrokerConfig, QueueConfig, RequeueHistory};
use deferq_broker::persistence::{
    DeadLetterFilter, DeadLetterReason, LeaseStatus, NackOutcome, Pagination, PostgresTaskStore,
    StoreError, TaskStore,
};
use deferq_broker::reliability::RetryPolicy;
use deferq_broker::{Broker, EnqueueOptions, TaskStatus};

const LEASE: Duration = Duration::from_secs(2);

struct Harness {
    clock: ManualClock,
    store: Arc<PostgresTaskStore>,
    broker: Broker,
    queue: String,
}

/// Connect and migrate, or `None` when no database is configured
async fn harness(retry: RetryPolicy) -> Option<Harness> {
    let Ok(database_url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping PostgreSQL test");
        return None;
    };

    let connected = PostgresTaskStore::connect(&database_url, 10)
        .await
        .expect("Failed to connect to PostgreSQL");
    connected.migrate().await.expect("Failed to run migrations");

    let clock = ManualClock::new();
    let store = Arc::new(PostgresTaskStore::with_clock(
        connected.pool().clone(),
        Arc::new(clock.clone()),
    ));
    let config = BrokerConfig::new().with_rng_seed(1).with_defaults(
        QueueConfig::new()
            .with_lease_duration(LEASE)
            .with_reaper_interval(Duration::from_secs(1))
            .with_retry(retry),
    );
    let broker = Broker::new(store.clone(), config).expect("valid config");

    Some(Harness {
        clock,
        store,
        broker,
        queue: format!("test-{}", Uuid::now_v7()),
    })
}

fn no_jitter(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::exponential()
        .with_max_attempts(max_attempts)
        .with_base_delay(Duration::from_secs(1))
        .with_backoff_multiplier(5.0)
        .with_max_delay(Duration::from_secs(3600))
        .with_jitter_fraction(0.0)
}

/// Remove everything a test left behind
async fn cleanup(h: &Harness) {
    sqlx::query("DELETE FROM deferq_tasks WHERE queue = $1")
        .bind(&h.queue)
        .execute(h.store.pool())
        .await
        .ok();
    sqlx::query("DELETE FROM deferq_dead_letters WHERE queue = $1")
        .bind(&h.queue)
        .execute(h.store.pool())
        .await
        .ok();
}

// ============================================
// Claim protocol
// ============================================

#[tokio::test]
async fn test_enqueue_claim_ack() {
    let Some(h) = harness(no_jitter(3)).await else {
        return;
    };

    let id = h
        .broker
        .enqueue(&h.queue, b"payload".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    let task = h.broker.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt, 0);

    let leased = h.broker.lease(&h.queue, None, 5).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].id, id);
    assert_eq!(leased[0].payload, b"payload");
    assert_eq!(leased[0].attempt, 1);

    assert!(h.broker.lease(&h.queue, None, 5).await.unwrap().is_empty());

    let status = h.broker.ack(id, leased[0].lease_token).await.unwrap();
    assert_eq!(status, LeaseStatus::Applied);
    assert!(h.broker.get_task(id).await.unwrap().is_none());
    assert_eq!(
        h.broker.ack(id, leased[0].lease_token).await.unwrap(),
        LeaseStatus::InvalidLease
    );

    cleanup(&h).await;
}

#[tokio::test]
async fn test_claim_order_and_delay() {
    let Some(h) = harness(no_jitter(3)).await else {
        return;
    };

    let delayed = h
        .broker
        .enqueue(
            &h.queue,
            b"late".to_vec(),
            EnqueueOptions::new().with_delay(Duration::from_secs(30)),
        )
        .await
        .unwrap();
    let mut ready = Vec::new();
    for i in 0..3u8 {
        ready.push(
            h.broker
                .enqueue(&h.queue, vec![i], EnqueueOptions::new())
                .await
                .unwrap(),
        );
    }

    let leased: Vec<_> = h
        .broker
        .lease(&h.queue, None, 10)
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(leased, ready);

    h.clock.advance(Duration::from_secs(30));
    let leased = h.broker.lease(&h.queue, None, 10).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert_eq!(leased[0].id, delayed);

    cleanup(&h).await;
}

#[tokio::test]
async fn test_concurrent_claims_are_disjoint() {
    let Some(h) = harness(no_jitter(3)).await else {
        return;
    };

    for i in 0..50u32 {
        h.broker
            .enqueue(&h.queue, i.to_be_bytes().to_vec(), EnqueueOptions::new())
            .await
            .unwrap();
    }

    let results = join_all((0..8).map(|_| {
        let broker = h.broker.clone();
        let queue = h.queue.clone();
        tokio::spawn(async move { broker.lease(&queue, None, 10).await.unwrap() })
    }))
    .await;

    let mut ids: Vec<_> = results
        .into_iter()
        .flat_map(|r| r.unwrap())
        .map(|t| t.id)
        .collect();
    let claimed = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), claimed, "a task was claimed twice");
    assert!(claimed <= 50);

    cleanup(&h).await;
}

// ============================================
// Failure handling
// ============================================

#[tokio::test]
async fn test_nack_backoff_and_exhaustion() {
    let Some(h) = harness(no_jitter(3)).await else {
        return;
    };

    let id = h
        .broker
        .enqueue(&h.queue, b"work".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();

    let mut delays = Vec::new();
    for _ in 0..3 {
        let leased = h.broker.lease(&h.queue, None, 1).await.unwrap();
        let outcome = h
            .broker
            .nack(id, leased[0].lease_token, true, "transient")
            .await
            .unwrap();
        let NackOutcome::Retrying { delay, .. } = outcome else {
            panic!("expected retry, got {outcome:?}");
        };
        delays.push(delay.as_secs());

        let task = h.broker.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::RetryScheduled);
        h.clock.advance(delay);
    }
    assert_eq!(delays, vec![1, 5, 25]);

    let leased = h.broker.lease(&h.queue, None, 1).await.unwrap();
    let outcome = h
        .broker
        .nack(id, leased[0].lease_token, true, "transient")
        .await
        .unwrap();
    assert!(matches!(outcome, NackOutcome::DeadLettered { .. }));

    let entries = h.broker.list_dead_letters(&h.queue).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].reason, DeadLetterReason::AttemptsExhausted);
    assert_eq!(entries[0].attempts, 4);
    assert_eq!(entries[0].failure_history.len(), 4);
    assert!(h.broker.get_task(id).await.unwrap().is_none());

    cleanup(&h).await;
}

#[tokio::test]
async fn test_reaper_reclaims_expired_lease() {
    let Some(h) = harness(no_jitter(3)).await else {
        return;
    };

    let id = h
        .broker
        .enqueue(&h.queue, b"work".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();
    let stale = h.broker.lease(&h.queue, None, 1).await.unwrap();

    h.clock.advance(LEASE + Duration::from_millis(1));
    let report = h.broker.reaper().run_once().await.unwrap();
    assert!(report.reclaimed >= 1);

    let task = h.broker.get_task(id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::RetryScheduled);
    assert_eq!(task.failure_history.len(), 1);

    let fresh = h.broker.lease(&h.queue, None, 1).await.unwrap();
    assert_eq!(fresh[0].attempt, 2);
    assert_eq!(
        h.broker.ack(id, stale[0].lease_token).await.unwrap(),
        LeaseStatus::InvalidLease
    );
    assert!(h
        .broker
        .extend_lease(id, fresh[0].lease_token, Duration::from_secs(10))
        .await
        .unwrap()
        .is_applied());

    cleanup(&h).await;
}

// ============================================
// Dedupe and dead letters
// ============================================

#[tokio::test]
async fn test_dedupe_key_lifecycle() {
    let Some(h) = harness(no_jitter(3)).await else {
        return;
    };
    let options = || EnqueueOptions::new().with_dedupe_key("invoice-7");

    let first = h.broker.enqueue(&h.queue, vec![1], options()).await.unwrap();
    let second = h.broker.enqueue(&h.queue, vec![2], options()).await.unwrap();
    assert_eq!(first, second);

    let leased = h.broker.lease(&h.queue, None, 1).await.unwrap();
    h.broker.ack(first, leased[0].lease_token).await.unwrap();

    let third = h.broker.enqueue(&h.queue, vec![3], options()).await.unwrap();
    assert_ne!(first, third);

    cleanup(&h).await;
}

#[tokio::test]
async fn test_dead_letter_requeue_archive_delete() {
    let Some(h) = harness(no_jitter(3)).await else {
        return;
    };

    let mut dlq_ids = Vec::new();
    for i in 0..3u8 {
        h.broker
            .enqueue(&h.queue, vec![i], EnqueueOptions::new())
            .await
            .unwrap();
        let leased = h.broker.lease(&h.queue, None, 1).await.unwrap();
        let NackOutcome::DeadLettered { dlq_id } = h
            .broker
            .nack(leased[0].id, leased[0].lease_token, false, "fatal")
            .await
            .unwrap()
        else {
            panic!("expected dead letter");
        };
        dlq_ids.push(dlq_id);
    }

    let revived = h.broker.requeue(dlq_ids[0]).await.unwrap();
    let task = h.broker.get_task(revived).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempt, 0);
    assert!(task.failure_history.is_empty());
    assert!(matches!(
        h.broker.requeue(dlq_ids[0]).await,
        Err(deferq_broker::BrokerError::Store(StoreError::DeadLetterNotFound(_)))
    ));

    h.broker.archive(dlq_ids[1]).await.unwrap();
    h.broker.delete_dead_letter(dlq_ids[2]).await.unwrap();

    assert!(h.broker.list_dead_letters(&h.queue).await.unwrap().is_empty());
    let with_archived = h
        .store
        .list_dead_letters(
            DeadLetterFilter {
                queue: Some(h.queue.clone()),
                include_archived: true,
            },
            Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(with_archived.len(), 1);
    assert!(with_archived[0].archived_at.is_some());

    cleanup(&h).await;
}

#[tokio::test]
async fn test_requeue_retaining_history() {
    let Some(h) = harness(no_jitter(3)).await else {
        return;
    };

    h.broker
        .enqueue(&h.queue, b"work".to_vec(), EnqueueOptions::new())
        .await
        .unwrap();
    let leased = h.broker.lease(&h.queue, None, 1).await.unwrap();
    let NackOutcome::DeadLettered { dlq_id } = h
        .broker
        .nack(leased[0].id, leased[0].lease_token, false, "fatal")
        .await
        .unwrap()
    else {
        panic!("expected dead letter");
    };

    let revived = h
        .store
        .requeue_dead_letter(dlq_id, RequeueHistory::Retain)
        .await
        .unwrap();
    let task = h.store.get_task(revived).await.unwrap().unwrap();
    assert_eq!(task.attempt, 0);
    assert_eq!(task.failure_history.len(), 1);

    let stats = h.broker.queue_stats(&h.queue).await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.dead_lettered, 0);

    cleanup(&h).await;
}
