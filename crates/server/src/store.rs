//! Subscriber persistence and lifecycle transitions.
//!
//! Two write paths exist, both atomic at the storage layer:
//! - [`SubscriberStore::upsert_unverified`] is a single `INSERT .. ON CONFLICT DO UPDATE`
//!   statement, so concurrent subscribes for one address never lose or duplicate a row.
//!   The last writer's token is the only one that stays valid.
//! - [`SubscriberStore::compare_and_merge`] reads, merges and writes one row inside a
//!   transaction (row-locked where the engine supports it). Verify and unsubscribe are
//!   expressed as merge functions over it.

use async_trait::async_trait;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, DatabaseConnection, EntityTrait, IntoActiveModel,
    QuerySelect, TransactionTrait,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::entity::subscriber::{self, SubscriberState};
use crate::error::StoreError;
use crate::token::TokenService;
use crate::validation::{EmailAddress, RequestMetadata};

pub type Subscriber = subscriber::Model;

/// Decision returned by a merge function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Merge {
    /// Leave the row untouched (idempotent repeat).
    Keep,
    /// Write this row back. The key cannot change.
    Replace(Subscriber),
}

/// Result of [`SubscriberStore::compare_and_merge`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Merged {
    pub subscriber: Subscriber,
    /// `false` when the merge function returned [`Merge::Keep`].
    pub changed: bool,
}

pub type MergeFn = Box<dyn FnOnce(&Subscriber) -> Result<Merge, StoreError> + Send>;

#[async_trait]
pub trait SubscriberStore: Send + Sync {
    async fn find(&self, email: &EmailAddress) -> Result<Option<Subscriber>, StoreError>;

    /// Inserts or resets the row for `email` to the unverified state with a fresh token.
    ///
    /// On conflict the token, sent-at, subscribed-at and metadata are overwritten,
    /// `unsubscribed_at` and `verified_at` are cleared and `email_verified` is forced to
    /// `false`: every (re)subscription needs fresh proof. `created_at` is preserved.
    async fn upsert_unverified(
        &self,
        email: &EmailAddress,
        token: &str,
        sent_at: OffsetDateTime,
        metadata: &RequestMetadata,
    ) -> Result<Subscriber, StoreError>;

    /// Atomically applies `merge` to the current row for `email`.
    ///
    /// Returns [`StoreError::NotFound`] when no row exists. Errors from `merge` abort
    /// the transaction without writing.
    async fn compare_and_merge(
        &self,
        email: &EmailAddress,
        merge: MergeFn,
    ) -> Result<Merged, StoreError>;

    /// `unverified → verified`. Repeating with the same token is a no-op success.
    async fn mark_verified(
        &self,
        email: &EmailAddress,
        token: &str,
        tokens: &TokenService,
    ) -> Result<Merged, StoreError> {
        let token = token.to_owned();
        let tokens = tokens.clone();
        let now = OffsetDateTime::now_utc();
        self.compare_and_merge(
            email,
            Box::new(move |current: &Subscriber| {
                verify_transition(current, &token, &tokens, now)
            }),
        )
        .await
    }

    /// `unverified | verified → unsubscribed`. Repeats keep the first `unsubscribed_at`.
    async fn mark_unsubscribed(
        &self,
        email: &EmailAddress,
        token: &str,
        tokens: &TokenService,
    ) -> Result<Merged, StoreError> {
        let token = token.to_owned();
        let tokens = tokens.clone();
        let now = OffsetDateTime::now_utc();
        self.compare_and_merge(
            email,
            Box::new(move |current: &Subscriber| {
                unsubscribe_transition(current, &token, &tokens, now)
            }),
        )
        .await
    }
}

/// Merge function behind [`SubscriberStore::mark_verified`].
///
/// The token must verify cryptographically *and* be the one currently stored, so a
/// token superseded by a later subscribe is rejected even though its HMAC is valid.
pub fn verify_transition(
    current: &Subscriber,
    token: &str,
    tokens: &TokenService,
    now: OffsetDateTime,
) -> Result<Merge, StoreError> {
    let is_current = current
        .verification_token
        .as_deref()
        .is_some_and(|stored| bool::from(stored.as_bytes().ct_eq(token.as_bytes())));
    if !is_current || !tokens.verify_verification_token(&current.email, token) {
        return Err(StoreError::TokenInvalid);
    }

    match current.state() {
        SubscriberState::Verified => Ok(Merge::Keep),
        // Only a new subscribe leaves the unsubscribed state.
        SubscriberState::Unsubscribed => Err(StoreError::TokenInvalid),
        SubscriberState::Unverified => Ok(Merge::Replace(Subscriber {
            email_verified: true,
            verified_at: Some(now),
            updated_at: now,
            ..current.clone()
        })),
    }
}

/// Merge function behind [`SubscriberStore::mark_unsubscribed`].
pub fn unsubscribe_transition(
    current: &Subscriber,
    token: &str,
    tokens: &TokenService,
    now: OffsetDateTime,
) -> Result<Merge, StoreError> {
    if !tokens.verify_unsubscribe_token(&current.email, token) {
        return Err(StoreError::TokenInvalid);
    }

    match current.state() {
        SubscriberState::Unsubscribed => Ok(Merge::Keep),
        SubscriberState::Unverified | SubscriberState::Verified => {
            Ok(Merge::Replace(Subscriber {
                unsubscribed_at: Some(now),
                updated_at: now,
                ..current.clone()
            }))
        }
    }
}

/// Active model that writes only the columns `next` changes. The key is never written.
fn changed_columns(current: &Subscriber, next: Subscriber) -> subscriber::ActiveModel {
    let mut active = current.clone().into_active_model();
    if next.email_verified != current.email_verified {
        active.email_verified = Set(next.email_verified);
    }
    if next.verification_token != current.verification_token {
        active.verification_token = Set(next.verification_token);
    }
    if next.verification_sent_at != current.verification_sent_at {
        active.verification_sent_at = Set(next.verification_sent_at);
    }
    if next.verified_at != current.verified_at {
        active.verified_at = Set(next.verified_at);
    }
    if next.unsubscribed_at != current.unsubscribed_at {
        active.unsubscribed_at = Set(next.unsubscribed_at);
    }
    if next.subscribed_at != current.subscribed_at {
        active.subscribed_at = Set(next.subscribed_at);
    }
    if next.ip_address != current.ip_address {
        active.ip_address = Set(next.ip_address);
    }
    if next.user_agent != current.user_agent {
        active.user_agent = Set(next.user_agent);
    }
    if next.country != current.country {
        active.country = Set(next.country);
    }
    if next.city != current.city {
        active.city = Set(next.city);
    }
    if next.updated_at != current.updated_at {
        active.updated_at = Set(next.updated_at);
    }
    active
}

/// [`SubscriberStore`] over any SeaORM connection (Postgres in production, SQLite in tests).
#[derive(Clone)]
pub struct SeaOrmSubscriberStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmSubscriberStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SubscriberStore for SeaOrmSubscriberStore {
    #[tracing::instrument(skip_all)]
    async fn find(&self, email: &EmailAddress) -> Result<Option<Subscriber>, StoreError> {
        Ok(subscriber::Entity::find_by_id(email.as_str().to_owned())
            .one(self.db.as_ref())
            .await?)
    }

    #[tracing::instrument(skip_all)]
    async fn upsert_unverified(
        &self,
        email: &EmailAddress,
        token: &str,
        sent_at: OffsetDateTime,
        metadata: &RequestMetadata,
    ) -> Result<Subscriber, StoreError> {
        let now = OffsetDateTime::now_utc();
        let row = subscriber::ActiveModel {
            email: Set(email.as_str().to_owned()),
            email_verified: Set(false),
            verification_token: Set(Some(token.to_owned())),
            verification_sent_at: Set(Some(sent_at)),
            verified_at: Set(None),
            unsubscribed_at: Set(None),
            subscribed_at: Set(sent_at),
            ip_address: Set(metadata.ip_address.clone()),
            user_agent: Set(metadata.user_agent.clone()),
            country: Set(metadata.country.clone()),
            city: Set(metadata.city.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let on_conflict = OnConflict::column(subscriber::Column::Email)
            .update_columns([
                subscriber::Column::EmailVerified,
                subscriber::Column::VerificationToken,
                subscriber::Column::VerificationSentAt,
                subscriber::Column::VerifiedAt,
                subscriber::Column::UnsubscribedAt,
                subscriber::Column::SubscribedAt,
                subscriber::Column::IpAddress,
                subscriber::Column::UserAgent,
                subscriber::Column::Country,
                subscriber::Column::City,
                subscriber::Column::UpdatedAt,
            ])
            .to_owned();

        let stored = subscriber::Entity::insert(row)
            .on_conflict(on_conflict)
            .exec_with_returning(self.db.as_ref())
            .await?;
        Ok(stored)
    }

    #[tracing::instrument(skip_all)]
    async fn compare_and_merge(
        &self,
        email: &EmailAddress,
        merge: MergeFn,
    ) -> Result<Merged, StoreError> {
        let txn = self.db.begin().await?;

        let current = subscriber::Entity::find_by_id(email.as_str().to_owned())
            .lock_exclusive()
            .one(&txn)
            .await?;
        let Some(current) = current else {
            txn.rollback().await?;
            return Err(StoreError::NotFound);
        };

        match merge(&current) {
            Err(e) => {
                txn.rollback().await?;
                Err(e)
            }
            Ok(Merge::Keep) => {
                txn.commit().await?;
                Ok(Merged {
                    subscriber: current,
                    changed: false,
                })
            }
            Ok(Merge::Replace(next)) => {
                let updated = changed_columns(&current, next).update(&txn).await?;
                txn.commit().await?;
                Ok(Merged {
                    subscriber: updated,
                    changed: true,
                })
            }
        }
    }
}
