//! In-process dispatch queue. Jobs are lost on restart.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{DeadLetter, Delivery, DispatchQueue, JobSource, VerificationJob};
use crate::error::{EnqueueFailed, QueueError};

/// Upper bound on a single wait inside `next_batch`, so delayed retries become
/// visible without an explicit wake-up.
const MAX_IDLE_WAIT: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
struct Entry {
    id: String,
    job: VerificationJob,
    /// Deliveries handed out so far.
    deliveries: u32,
    enqueued_at: OffsetDateTime,
}

#[derive(Default)]
struct State {
    ready: VecDeque<Entry>,
    delayed: Vec<(Instant, Entry)>,
    in_flight: HashMap<String, Entry>,
    dead: Vec<DeadLetter>,
}

impl State {
    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(at, _)| *at <= now);
        self.delayed = pending;
        self.ready.extend(due.into_iter().map(|(_, entry)| entry));
    }
}

#[derive(Default)]
pub struct MemoryDispatchQueue {
    state: Mutex<State>,
    notify: Notify,
}

impl MemoryDispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs waiting for delivery, including delayed retries and leased jobs.
    pub async fn pending_count(&self) -> usize {
        let state = self.state.lock().await;
        state.ready.len() + state.delayed.len() + state.in_flight.len()
    }

    /// Snapshot of the dead-letter sink, oldest first.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }
}

#[async_trait]
impl DispatchQueue for MemoryDispatchQueue {
    async fn enqueue(&self, job: VerificationJob) -> Result<(), EnqueueFailed> {
        let entry = Entry {
            id: Uuid::new_v4().to_string(),
            job,
            deliveries: 0,
            enqueued_at: OffsetDateTime::now_utc(),
        };
        self.state.lock().await.ready.push_back(entry);
        self.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl JobSource for MemoryDispatchQueue {
    async fn next_batch(
        &self,
        max_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let deadline = Instant::now() + max_wait;
        let mut batch = Vec::new();

        loop {
            {
                let mut state = self.state.lock().await;
                state.promote_due(Instant::now());
                while batch.len() < max_size {
                    let Some(mut entry) = state.ready.pop_front() else {
                        break;
                    };
                    entry.deliveries += 1;
                    batch.push(Delivery {
                        id: entry.id.clone(),
                        job: entry.job.clone(),
                        attempt: entry.deliveries,
                        enqueued_at: entry.enqueued_at,
                    });
                    state.in_flight.insert(entry.id.clone(), entry);
                }
            }

            let now = Instant::now();
            if batch.len() >= max_size || now >= deadline {
                return Ok(batch);
            }

            let wait = (deadline - now).min(MAX_IDLE_WAIT);
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.state.lock().await.in_flight.remove(&delivery.id);
        Ok(())
    }

    async fn retry(
        &self,
        delivery: &Delivery,
        delay: Duration,
        _error: &str,
    ) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.in_flight.remove(&delivery.id) {
            state.delayed.push((Instant::now() + delay, entry));
        }
        drop(state);
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.in_flight.remove(&delivery.id).is_some() {
            state.dead.push(DeadLetter {
                id: delivery.id.clone(),
                job: Some(delivery.job.clone()),
                attempts: delivery.attempt,
                reason: reason.to_string(),
                dead_lettered_at: OffsetDateTime::now_utc(),
            });
        }
        Ok(())
    }
}
