//! Durable dispatch queue backed by the `dispatch_job` and `dead_letter_job` tables.
//!
//! A job is visible while `available_at <= now`. Claiming it is a conditional update
//! that bumps `attempts` and pushes `available_at` forward by the visibility timeout,
//! guarded by the `attempts` value that was read. Only one consumer can win that update,
//! and a consumer that dies simply lets the lease run out.

use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, TransactionTrait,
};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

use super::{DeadLetter, Delivery, DispatchQueue, JobSource, VerificationJob, to_time_duration};
use crate::entity::{dead_letter_job, dispatch_job};
use crate::error::{EnqueueFailed, QueueError};

/// Longest `last_error` / reason kept in the tables.
const MAX_ERROR_LEN: usize = 2_000;

#[derive(Clone)]
pub struct SeaOrmDispatchQueue {
    db: Arc<DatabaseConnection>,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl SeaOrmDispatchQueue {
    pub fn new(
        db: Arc<DatabaseConnection>,
        visibility_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            db,
            visibility_timeout,
            poll_interval,
        }
    }

    /// Jobs still in `dispatch_job`, leased or not.
    pub async fn pending_count(&self) -> Result<u64, QueueError> {
        Ok(dispatch_job::Entity::find().count(self.db.as_ref()).await?)
    }

    /// Everything in the dead-letter table, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, QueueError> {
        let rows = dead_letter_job::Entity::find()
            .order_by_asc(dead_letter_job::Column::DeadLetteredAt)
            .all(self.db.as_ref())
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| DeadLetter {
                job: serde_json::from_str(&row.payload).ok(),
                id: row.id,
                attempts: u32::try_from(row.attempts).unwrap_or(0),
                reason: row.last_error.unwrap_or_default(),
                dead_lettered_at: row.dead_lettered_at,
            })
            .collect())
    }

    /// Leases up to `limit` visible jobs, skipping ids in `held`.
    ///
    /// `held` are the jobs already in the batch being assembled: their lease may have run
    /// out while the batch kept waiting, and claiming them again would hand the same job
    /// out twice in one batch.
    async fn claim(&self, limit: usize, held: &[String]) -> Result<Vec<Delivery>, QueueError> {
        let now = OffsetDateTime::now_utc();
        let lease_until = later(now, self.visibility_timeout)?;

        let mut query = dispatch_job::Entity::find()
            .filter(dispatch_job::Column::AvailableAt.lte(now))
            .order_by_asc(dispatch_job::Column::AvailableAt)
            .limit(limit as u64);
        if !held.is_empty() {
            query = query.filter(dispatch_job::Column::Id.is_not_in(held.iter().cloned()));
        }
        let candidates = query.all(self.db.as_ref()).await?;

        let mut claimed = Vec::with_capacity(candidates.len());

        for row in candidates {
            let result = dispatch_job::Entity::update_many()
                .col_expr(dispatch_job::Column::Attempts, Expr::value(row.attempts + 1))
                .col_expr(dispatch_job::Column::AvailableAt, Expr::value(lease_until))
                .filter(dispatch_job::Column::Id.eq(row.id.as_str()))
                .filter(dispatch_job::Column::Attempts.eq(row.attempts))
                .exec(self.db.as_ref())
                .await?;
            if result.rows_affected != 1 {
                // Another consumer won the lease.
                continue;
            }

            match serde_json::from_str::<VerificationJob>(&row.payload) {
                Ok(job) => claimed.push(Delivery {
                    id: row.id,
                    job,
                    attempt: u32::try_from(row.attempts + 1).unwrap_or(u32::MAX),
                    enqueued_at: row.created_at,
                }),
                Err(e) => {
                    tracing::error!(
                        name = "dispatch.claim.undecodable_payload",
                        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                        job_id = %row.id,
                        error = %e,
                        message = "Dead-lettering job with undecodable payload"
                    );
                    self.bury(&row.id, row.attempts + 1, &format!("undecodable payload: {e}"))
                        .await?;
                }
            }
        }

        Ok(claimed)
    }

    /// Moves one job to `dead_letter_job` and removes it from `dispatch_job` atomically.
    /// A job that is already gone, or whose lease `lease` has since been handed to another
    /// consumer, is left alone.
    async fn bury(&self, id: &str, lease: i32, reason: &str) -> Result<(), QueueError> {
        let txn = self.db.begin().await?;

        let row = dispatch_job::Entity::find_by_id(id.to_owned())
            .one(&txn)
            .await?;
        let Some(row) = row.filter(|row| row.attempts == lease) else {
            txn.rollback().await?;
            tracing::debug!(
                name = "dispatch.bury.lease_lost",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                job_id = %id,
                lease,
                message = "Job no longer held under this lease, not dead-lettering"
            );
            return Ok(());
        };

        let already_buried = dead_letter_job::Entity::find_by_id(id.to_owned())
            .one(&txn)
            .await?
            .is_some();
        if !already_buried {
            dead_letter_job::ActiveModel {
                id: Set(row.id.clone()),
                payload: Set(row.payload.clone()),
                attempts: Set(row.attempts),
                last_error: Set(Some(truncate(reason))),
                enqueued_at: Set(row.created_at),
                dead_lettered_at: Set(OffsetDateTime::now_utc()),
            }
            .insert(&txn)
            .await?;
        }

        dispatch_job::Entity::delete_by_id(row.id).exec(&txn).await?;
        txn.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl DispatchQueue for SeaOrmDispatchQueue {
    #[tracing::instrument(skip_all)]
    async fn enqueue(&self, job: VerificationJob) -> Result<(), EnqueueFailed> {
        let payload = serde_json::to_string(&job).map_err(QueueError::from)?;
        let now = OffsetDateTime::now_utc();

        dispatch_job::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            payload: Set(payload),
            attempts: Set(0),
            available_at: Set(now),
            last_error: Set(None),
            created_at: Set(now),
        }
        .insert(self.db.as_ref())
        .await
        .map_err(QueueError::from)?;
        Ok(())
    }
}

#[async_trait]
impl JobSource for SeaOrmDispatchQueue {
    async fn next_batch(
        &self,
        max_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        let mut batch: Vec<Delivery> = Vec::new();

        loop {
            let wanted = max_size.saturating_sub(batch.len());
            if wanted > 0 {
                let held: Vec<String> = batch.iter().map(|d| d.id.clone()).collect();
                batch.extend(self.claim(wanted, &held).await?);
            }

            let now = tokio::time::Instant::now();
            if batch.len() >= max_size || now >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep((deadline - now).min(self.poll_interval)).await;
        }
    }

    #[tracing::instrument(skip_all, fields(job_id = %delivery.id))]
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        // A holder whose lease was handed on leaves the job to the new holder.
        let result = dispatch_job::Entity::delete_many()
            .filter(dispatch_job::Column::Id.eq(delivery.id.as_str()))
            .filter(dispatch_job::Column::Attempts.eq(lease_of(delivery)))
            .exec(self.db.as_ref())
            .await?;
        if result.rows_affected == 0 {
            tracing::debug!(
                name = "dispatch.ack.lease_lost",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                attempt = delivery.attempt,
                message = "Job no longer held under this lease, ack ignored"
            );
        }
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(job_id = %delivery.id))]
    async fn retry(
        &self,
        delivery: &Delivery,
        delay: Duration,
        error: &str,
    ) -> Result<(), QueueError> {
        let available_at = later(OffsetDateTime::now_utc(), delay)?;
        // Guarded by the lease version: a consumer whose lease already expired and was
        // handed to someone else must not move the job.
        dispatch_job::Entity::update_many()
            .col_expr(dispatch_job::Column::AvailableAt, Expr::value(available_at))
            .col_expr(
                dispatch_job::Column::LastError,
                Expr::value(Some(truncate(error))),
            )
            .filter(dispatch_job::Column::Id.eq(delivery.id.as_str()))
            .filter(dispatch_job::Column::Attempts.eq(lease_of(delivery)))
            .exec(self.db.as_ref())
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(job_id = %delivery.id))]
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), QueueError> {
        self.bury(&delivery.id, lease_of(delivery), reason).await
    }
}

/// The `attempts` value a delivery was leased under.
fn lease_of(delivery: &Delivery) -> i32 {
    i32::try_from(delivery.attempt).unwrap_or(i32::MAX)
}

fn later(now: OffsetDateTime, delay: Duration) -> Result<OffsetDateTime, QueueError> {
    now.checked_add(to_time_duration(delay))
        .ok_or(QueueError::ScheduleOverflow(delay))
}

fn truncate(message: &str) -> String {
    message.chars().take(MAX_ERROR_LEN).collect()
}
