//! Asynchronous, at-least-once dispatch of verification emails.
//!
//! The producer side ([`DispatchQueue`]) is called by the subscription service strictly
//! after the subscriber row commits. If the process dies between the two, the subscriber
//! stays `unverified` without an email until they subscribe again; nothing re-triggers it.
//!
//! The consumer side ([`JobSource`]) hands out leased batches. [`worker::EmailDeliveryWorker`]
//! decides per message whether to ack, retry or dead-letter, and the scheduler loop applies
//! that decision back to the source.
//!
//! ## Submodules
//!
//! - `database` - durable queue on the `dispatch_job` / `dead_letter_job` tables
//! - `memory` - in-process queue with the same contract
//! - `policy` - retry budget and backoff
//! - `worker` - per-message handling and the consumer loop

pub mod database;
pub mod memory;
pub mod policy;
pub mod worker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use time::OffsetDateTime;

use crate::error::{EnqueueFailed, QueueError};
use crate::validation::RequestMetadata;

pub use database::SeaOrmDispatchQueue;
pub use memory::MemoryDispatchQueue;
pub use policy::RetryPolicy;
pub use worker::{BatchSettings, EmailDeliveryWorker, Outcome, spawn_consumers};

/// Queue payload. Everything needed to render the email travels with the job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationJob {
    pub email: String,
    pub verification_token: String,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    #[serde(default)]
    pub metadata: RequestMetadata,
}

/// One leased message handed to a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub job: VerificationJob,
    /// 1 on first delivery, incremented by the queue on every redelivery.
    pub attempt: u32,
    pub enqueued_at: OffsetDateTime,
}

/// A job that left the queue for good. `job` is `None` when the stored payload
/// could not be decoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: String,
    pub job: Option<VerificationJob>,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: OffsetDateTime,
}

#[async_trait]
pub trait DispatchQueue: Send + Sync {
    async fn enqueue(&self, job: VerificationJob) -> Result<(), EnqueueFailed>;
}

#[async_trait]
pub trait JobSource: Send + Sync {
    /// Leases up to `max_size` messages. Returns when the batch is full or `max_wait`
    /// has elapsed, so the batch may be empty.
    async fn next_batch(
        &self,
        max_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Removes the message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Releases the message for redelivery after `delay`.
    async fn retry(
        &self,
        delivery: &Delivery,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError>;

    /// Moves the message to the dead-letter sink and removes it from the queue.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError>;
}

pub(crate) fn to_time_duration(d: Duration) -> time::Duration {
    time::Duration::try_from(d).unwrap_or(time::Duration::MAX)
}
