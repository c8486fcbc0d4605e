//! Subscribe, verify and unsubscribe use cases.
//!
//! Handlers stay thin: they turn HTTP input into validated requests and hand them here.
//! Every collaborator sits behind a trait so tests can swap them out.

use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use utoipa::ToSchema;

use crate::bot_gate::BotGate;
use crate::dispatch::{DispatchQueue, VerificationJob};
use crate::error::{StoreError, SubscriptionError};
use crate::logging::MaskedEmail;
use crate::store::SubscriberStore;
use crate::token::TokenService;
use crate::validation::{
    EmailAddress, RequestMetadata, SubscribeRequest, UnsubscribeRequest, VerifyRequest,
};

/// Returned for every accepted subscribe, whatever state the address was in before.
pub const SUBSCRIBE_MESSAGE: &str =
    "Thanks! Please check your inbox and confirm your subscription.";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct SubscribeResponse {
    pub success: bool,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Verified,
    AlreadyVerified,
    Unsubscribed,
    AlreadyUnsubscribed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct ActionResponse {
    pub success: bool,
    pub status: ActionStatus,
}

#[derive(Clone)]
pub struct SubscriptionService {
    store: Arc<dyn SubscriberStore>,
    bot_gate: Arc<dyn BotGate>,
    queue: Arc<dyn DispatchQueue>,
    tokens: TokenService,
    bot_check_help_url: Option<String>,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriberStore>,
        bot_gate: Arc<dyn BotGate>,
        queue: Arc<dyn DispatchQueue>,
        tokens: TokenService,
    ) -> Self {
        Self {
            store,
            bot_gate,
            queue,
            tokens,
            bot_check_help_url: None,
        }
    }

    /// Link returned alongside failed bot checks.
    pub fn with_bot_check_help_url(mut self, help_url: Option<String>) -> Self {
        self.bot_check_help_url = help_url;
        self
    }

    fn bot_check_failed(&self) -> SubscriptionError {
        SubscriptionError::BotCheckFailed {
            help_url: self.bot_check_help_url.clone(),
        }
    }

    /// Bot check, fresh token, upsert, enqueue. The enqueue only happens after the
    /// upsert has committed.
    #[tracing::instrument(skip_all, fields(email = %MaskedEmail(request.email.as_str())))]
    pub async fn subscribe(
        &self,
        request: SubscribeRequest,
        metadata: RequestMetadata,
    ) -> Result<SubscribeResponse, SubscriptionError> {
        let metadata = metadata.normalized();
        let email = request.email;

        if request.bot_token.is_empty() {
            return Err(self.bot_check_failed());
        }
        match self
            .bot_gate
            .verify(&request.bot_token, metadata.ip_address.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) => return Err(self.bot_check_failed()),
            Err(e) => {
                tracing::warn!(
                    name = "subscription.subscribe.bot_gate_unavailable",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    error = %e,
                    message = "Bot verification failed to complete, rejecting"
                );
                return Err(self.bot_check_failed());
            }
        }

        let now = OffsetDateTime::now_utc();
        let token = self.tokens.generate_verification_token(email.as_str());

        self.store
            .upsert_unverified(&email, &token, now, &metadata)
            .await
            .map_err(|e| {
                tracing::error!(
                    name = "subscription.subscribe.upsert_failed",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    email = %MaskedEmail(email.as_str()),
                    error = %e,
                    message = "Failed to store subscriber"
                );
                SubscriptionError::from(e)
            })?;

        let job = VerificationJob {
            email: email.into_inner(),
            verification_token: token,
            requested_at: now,
            metadata,
        };
        if let Err(e) = self.queue.enqueue(job).await {
            // The row is committed as unverified; a repeated subscribe recovers.
            tracing::error!(
                name = "subscription.subscribe.enqueue_failed",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                error = %e,
                message = "Subscriber stored but verification email could not be queued"
            );
            return Err(SubscriptionError::DispatchUnavailable(e));
        }

        Ok(SubscribeResponse {
            success: true,
            message: SUBSCRIBE_MESSAGE.to_string(),
        })
    }

    #[tracing::instrument(skip_all, fields(email = %MaskedEmail(request.email.as_str())))]
    pub async fn verify(&self, request: VerifyRequest) -> Result<ActionResponse, SubscriptionError> {
        let merged = self
            .store
            .mark_verified(&request.email, &request.token, &self.tokens)
            .await
            .map_err(|e| log_store_error("subscription.verify.failed", &request.email, e))?;

        let status = if merged.changed {
            tracing::info!(
                name = "subscription.verify.verified",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                email = %MaskedEmail(request.email.as_str()),
                message = "Subscriber verified"
            );
            ActionStatus::Verified
        } else {
            ActionStatus::AlreadyVerified
        };
        Ok(ActionResponse {
            success: true,
            status,
        })
    }

    #[tracing::instrument(skip_all, fields(email = %MaskedEmail(request.email.as_str())))]
    pub async fn unsubscribe(
        &self,
        request: UnsubscribeRequest,
    ) -> Result<ActionResponse, SubscriptionError> {
        let merged = self
            .store
            .mark_unsubscribed(&request.email, &request.token, &self.tokens)
            .await
            .map_err(|e| log_store_error("subscription.unsubscribe.failed", &request.email, e))?;

        let status = if merged.changed {
            tracing::info!(
                name = "subscription.unsubscribe.unsubscribed",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                email = %MaskedEmail(request.email.as_str()),
                message = "Subscriber unsubscribed"
            );
            ActionStatus::Unsubscribed
        } else {
            ActionStatus::AlreadyUnsubscribed
        };
        Ok(ActionResponse {
            success: true,
            status,
        })
    }
}

fn log_store_error(
    event: &'static str,
    email: &EmailAddress,
    e: StoreError,
) -> SubscriptionError {
    let e = SubscriptionError::from(e);
    if e.is_retryable() {
        tracing::error!(
            name = event,
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            email = %MaskedEmail(email.as_str()),
            error = %e,
            message = "Storage failure"
        );
    } else {
        tracing::debug!(
            name = event,
            target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
            email = %MaskedEmail(email.as_str()),
            error = %e,
            message = "Request rejected"
        );
    }
    e
}
