//! Verification email pipeline: worker outcomes over both queue implementations.

mod common;

use common::{BASE_URL, Reply, ScriptedTransport, create_test_db, tokens};
use newsletter::config::DispatchConfig;
use newsletter::dispatch::{
    BatchSettings, Delivery, DispatchQueue, EmailDeliveryWorker, JobSource, MemoryDispatchQueue,
    Outcome, RetryPolicy, SeaOrmDispatchQueue, VerificationJob, spawn_consumers,
};
use newsletter::entity::dispatch_job;
use newsletter::error::QueueError;
use newsletter::links::LinkBuilder;
use newsletter::validation::RequestMetadata;
use sea_orm::{ActiveModelTrait, ActiveValue::Set};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use time::OffsetDateTime;

const WAIT: Duration = Duration::from_millis(30);

fn job(address: &str) -> VerificationJob {
    VerificationJob {
        email: address.to_string(),
        verification_token: tokens().generate_verification_token(address),
        requested_at: OffsetDateTime::now_utc(),
        metadata: RequestMetadata::default(),
    }
}

fn immediate_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}

fn worker(transport: Arc<ScriptedTransport>, policy: RetryPolicy) -> EmailDeliveryWorker {
    EmailDeliveryWorker::new(
        transport,
        tokens(),
        LinkBuilder::new(BASE_URL).unwrap(),
        policy,
        DispatchConfig::default().skip_domains,
    )
}

async fn drain_once(worker: &EmailDeliveryWorker, source: &dyn JobSource) -> usize {
    let batch = source.next_batch(10, WAIT).await.unwrap();
    let size = batch.len();
    worker.process_batch(source, batch).await;
    size
}

// =============================================================================
// Worker outcomes
// =============================================================================

#[tokio::test]
async fn test_handle_renders_links_and_acks() {
    let transport = Arc::new(ScriptedTransport::default());
    let worker = worker(transport.clone(), immediate_policy(3));
    let delivery = Delivery {
        id: "job-1".into(),
        job: job("reader@newsletter.dev"),
        attempt: 1,
        enqueued_at: OffsetDateTime::now_utc(),
    };

    assert_eq!(worker.handle(&delivery).await, Outcome::Ack);

    let sent = transport.sent.lock().await;
    assert_eq!(sent.len(), 1);
    let email = &sent[0];
    assert_eq!(email.to, "reader@newsletter.dev");
    assert!(email.text.contains(&format!("{BASE_URL}/v1/newsletter/verify?token=")));
    assert!(email.html.contains("/v1/newsletter/verify?token="));

    let unsubscribe = email.list_unsubscribe.as_deref().unwrap();
    let url = url::Url::parse(unsubscribe).unwrap();
    assert_eq!(url.path(), "/v1/newsletter/unsubscribe");
    let token = url
        .query_pairs()
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())
        .unwrap();
    assert!(tokens().verify_unsubscribe_token("reader@newsletter.dev", &token));
}

#[tokio::test]
async fn test_handle_is_deterministic_for_a_job() {
    let worker = worker(Arc::new(ScriptedTransport::default()), immediate_policy(3));
    let delivery = Delivery {
        id: "job-1".into(),
        job: job("reader@newsletter.dev"),
        attempt: 2,
        enqueued_at: OffsetDateTime::now_utc(),
    };
    assert_eq!(worker.render(&delivery).unwrap(), worker.render(&delivery).unwrap());
}

#[tokio::test]
async fn test_handle_skips_reserved_domains_without_sending() {
    let transport = Arc::new(ScriptedTransport::default());
    let worker = worker(transport.clone(), immediate_policy(3));

    for address in ["a@example.com", "b@mail.example.org", "c@foo.test"] {
        let delivery = Delivery {
            id: address.into(),
            job: job(address),
            attempt: 1,
            enqueued_at: OffsetDateTime::now_utc(),
        };
        assert_eq!(worker.handle(&delivery).await, Outcome::Skip, "{address}");
    }
    assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_handle_retry_then_dead_letter_by_attempt() {
    let transport = Arc::new(ScriptedTransport::always(Reply::Transient, 10));
    let policy = RetryPolicy {
        max_retries: 3,
        base_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(3600),
    };
    let worker = worker(transport, policy);
    let mut delivery = Delivery {
        id: "job-1".into(),
        job: job("reader@newsletter.dev"),
        attempt: 1,
        enqueued_at: OffsetDateTime::now_utc(),
    };

    assert!(matches!(
        worker.handle(&delivery).await,
        Outcome::Retry { delay, .. } if delay == Duration::from_secs(30)
    ));
    delivery.attempt = 2;
    assert!(matches!(
        worker.handle(&delivery).await,
        Outcome::Retry { delay, .. } if delay == Duration::from_secs(60)
    ));
    delivery.attempt = 3;
    assert!(matches!(worker.handle(&delivery).await, Outcome::DeadLetter { .. }));
}

#[tokio::test]
async fn test_handle_permanent_failure_dead_letters_immediately() {
    let transport = Arc::new(ScriptedTransport::new([Reply::Permanent]));
    let worker = worker(transport, immediate_policy(5));
    let delivery = Delivery {
        id: "job-1".into(),
        job: job("reader@newsletter.dev"),
        attempt: 1,
        enqueued_at: OffsetDateTime::now_utc(),
    };
    assert!(matches!(worker.handle(&delivery).await, Outcome::DeadLetter { .. }));
}

// =============================================================================
// Memory queue pipeline
// =============================================================================

#[tokio::test]
async fn test_memory_scenario_e_dead_letters_exactly_once() {
    let queue = MemoryDispatchQueue::new();
    let transport = Arc::new(ScriptedTransport::always(Reply::Transient, 100));
    let worker = worker(transport.clone(), immediate_policy(3));
    queue.enqueue(job("reader@newsletter.dev")).await.unwrap();

    for _ in 0..3 {
        assert_eq!(drain_once(&worker, &queue).await, 1);
    }
    assert_eq!(drain_once(&worker, &queue).await, 0);

    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    let dead = queue.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].job.as_ref().unwrap().email, "reader@newsletter.dev");
    assert_eq!(queue.pending_count().await, 0);
}

#[tokio::test]
async fn test_memory_transient_failure_then_success() {
    let queue = MemoryDispatchQueue::new();
    let transport = Arc::new(ScriptedTransport::new([Reply::Transient]));
    let worker = worker(transport.clone(), immediate_policy(3));
    queue.enqueue(job("reader@newsletter.dev")).await.unwrap();

    drain_once(&worker, &queue).await;
    drain_once(&worker, &queue).await;

    assert_eq!(transport.sent.lock().await.len(), 1);
    assert!(queue.dead_letters().await.is_empty());
    assert_eq!(queue.pending_count().await, 0);
}

#[tokio::test]
async fn test_consumers_drain_queue_until_stopped() {
    let queue = Arc::new(MemoryDispatchQueue::new());
    let transport = Arc::new(ScriptedTransport::default());
    let worker = Arc::new(worker(transport.clone(), immediate_policy(3)));
    for i in 0..5 {
        queue.enqueue(job(&format!("r{i}@newsletter.dev"))).await.unwrap();
    }

    let running = Arc::new(AtomicBool::new(true));
    let handles = spawn_consumers(
        worker,
        queue.clone(),
        BatchSettings {
            batch_size: 2,
            batch_timeout: WAIT,
        },
        2,
        running.clone(),
    );

    for _ in 0..100 {
        if transport.sent.lock().await.len() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    running.store(false, Ordering::Relaxed);
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(transport.sent.lock().await.len(), 5);
    assert_eq!(queue.pending_count().await, 0);
}

// =============================================================================
// Durable queue
// =============================================================================

#[tokio::test]
async fn test_durable_lease_is_exclusive_and_expires() {
    let db = create_test_db().await;
    let long = SeaOrmDispatchQueue::new(db.clone(), Duration::from_secs(300), Duration::from_millis(5));
    long.enqueue(job("reader@newsletter.dev")).await.unwrap();

    let first = long.next_batch(10, WAIT).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].attempt, 1);

    // A second consumer sees nothing while the lease is held.
    let other = SeaOrmDispatchQueue::new(db.clone(), Duration::from_secs(300), Duration::from_millis(5));
    assert!(other.next_batch(10, WAIT).await.unwrap().is_empty());

    // A consumer that crashed never acks; with a short lease the job comes back.
    let short = SeaOrmDispatchQueue::new(db.clone(), Duration::from_millis(1), Duration::from_millis(5));
    let db_side = dispatch_job::ActiveModel {
        id: Set(first[0].id.clone()),
        available_at: Set(OffsetDateTime::now_utc() - time::Duration::seconds(1)),
        ..Default::default()
    };
    db_side.update(db.as_ref()).await.unwrap();

    // The lease runs out again while the batch is still waiting; the job is not repeated.
    let again = short.next_batch(10, WAIT).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, first[0].id);
    assert_eq!(again[0].attempt, 2);

    // The stale holder can no longer push the job around.
    long.retry(&first[0], Duration::from_secs(3600), "stale").await.unwrap();
    short.ack(&again[0]).await.unwrap();
    assert_eq!(short.pending_count().await.unwrap(), 0);
}

async fn expire_lease(db: &sea_orm::DatabaseConnection, id: &str) {
    dispatch_job::ActiveModel {
        id: Set(id.to_string()),
        available_at: Set(OffsetDateTime::now_utc() - time::Duration::seconds(1)),
        ..Default::default()
    }
    .update(db)
    .await
    .unwrap();
}

#[tokio::test]
async fn test_durable_batch_holds_each_job_once() {
    let db = create_test_db().await;
    // Leases expire long before the batch wait is over.
    let queue = SeaOrmDispatchQueue::new(db, Duration::from_millis(1), Duration::from_millis(2));
    queue.enqueue(job("first@newsletter.dev")).await.unwrap();
    queue.enqueue(job("second@newsletter.dev")).await.unwrap();

    let batch = queue.next_batch(10, WAIT).await.unwrap();
    assert_eq!(batch.len(), 2);
    assert_ne!(batch[0].id, batch[1].id);
    assert!(batch.iter().all(|d| d.attempt == 1));
}

#[tokio::test]
async fn test_durable_stale_holder_cannot_dead_letter_or_ack() {
    let db = create_test_db().await;
    let queue = SeaOrmDispatchQueue::new(db.clone(), Duration::from_secs(300), Duration::from_millis(5));
    queue.enqueue(job("reader@newsletter.dev")).await.unwrap();

    let stale = queue.next_batch(1, WAIT).await.unwrap().remove(0);
    expire_lease(db.as_ref(), &stale.id).await;
    let live = queue.next_batch(1, WAIT).await.unwrap().remove(0);
    assert_eq!(live.id, stale.id);
    assert_eq!(live.attempt, 2);

    queue.dead_letter(&stale, "retries exhausted").await.unwrap();
    queue.ack(&stale).await.unwrap();
    assert!(queue.dead_letters().await.unwrap().is_empty());
    assert_eq!(queue.pending_count().await.unwrap(), 1);

    queue.ack(&live).await.unwrap();
    assert_eq!(queue.pending_count().await.unwrap(), 0);
    assert!(queue.dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_durable_delay_overflow_is_an_error() {
    let db = create_test_db().await;
    let queue = SeaOrmDispatchQueue::new(db.clone(), Duration::from_secs(300), Duration::from_millis(5));
    queue.enqueue(job("reader@newsletter.dev")).await.unwrap();
    let delivery = queue.next_batch(1, WAIT).await.unwrap().remove(0);

    let result = queue.retry(&delivery, Duration::MAX, "smtp down").await;
    assert!(matches!(result, Err(QueueError::ScheduleOverflow(_))));

    let unbounded = SeaOrmDispatchQueue::new(db, Duration::MAX, Duration::from_millis(5));
    assert!(matches!(
        unbounded.next_batch(1, WAIT).await,
        Err(QueueError::ScheduleOverflow(_))
    ));
}

#[tokio::test]
async fn test_durable_scenario_e_dead_letters_exactly_once() {
    let db = create_test_db().await;
    let queue = SeaOrmDispatchQueue::new(db, Duration::from_secs(300), Duration::from_millis(5));
    let transport = Arc::new(ScriptedTransport::always(Reply::Transient, 100));
    let worker = worker(transport.clone(), immediate_policy(2));
    queue.enqueue(job("reader@newsletter.dev")).await.unwrap();

    assert_eq!(drain_once(&worker, &queue).await, 1);
    assert_eq!(drain_once(&worker, &queue).await, 1);
    assert_eq!(drain_once(&worker, &queue).await, 0);

    assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    assert_eq!(queue.pending_count().await.unwrap(), 0);
    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 2);
    assert!(dead[0].reason.contains("retries exhausted"));
}

#[tokio::test]
async fn test_durable_acked_job_is_gone() {
    let db = create_test_db().await;
    let queue = SeaOrmDispatchQueue::new(db, Duration::from_secs(300), Duration::from_millis(5));
    let transport = Arc::new(ScriptedTransport::default());
    let worker = worker(transport.clone(), immediate_policy(3));
    queue.enqueue(job("reader@newsletter.dev")).await.unwrap();

    drain_once(&worker, &queue).await;
    assert_eq!(transport.sent.lock().await.len(), 1);
    assert_eq!(queue.pending_count().await.unwrap(), 0);
    assert!(queue.dead_letters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_durable_undecodable_payload_goes_to_dead_letter() {
    let db = create_test_db().await;
    let now = OffsetDateTime::now_utc();
    dispatch_job::ActiveModel {
        id: Set("broken".into()),
        payload: Set("{not json".into()),
        attempts: Set(0),
        available_at: Set(now),
        last_error: Set(None),
        created_at: Set(now),
    }
    .insert(db.as_ref())
    .await
    .unwrap();

    let queue = SeaOrmDispatchQueue::new(db, Duration::from_secs(300), Duration::from_millis(5));
    assert!(queue.next_batch(10, WAIT).await.unwrap().is_empty());

    let dead = queue.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, "broken");
    assert!(dead[0].job.is_none());
    assert_eq!(queue.pending_count().await.unwrap(), 0);
}
