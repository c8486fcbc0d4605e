//! Verification email consumer.
//!
//! [`EmailDeliveryWorker::handle`] turns one delivery into an [`Outcome`] without touching
//! the queue; [`EmailDeliveryWorker::run`] pulls batches, handles them concurrently and
//! applies the outcomes to the [`JobSource`].

use futures::future::join_all;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::{Delivery, JobSource, RetryPolicy};
use crate::config::DispatchConfig;
use crate::email_templates::{VERIFICATION_SUBJECT, VerificationEmailTemplate};
use crate::error::QueueError;
use crate::links::LinkBuilder;
use crate::logging::MaskedEmail;
use crate::mailer::{EmailTransport, OutboundEmail};
use crate::token::TokenService;
use crate::validation::domain_matches_any;

/// Pause after a queue error before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Sent; remove from the queue.
    Ack,
    /// Filtered out by `skip_domains`; removed without sending.
    Skip,
    Retry { delay: Duration, error: String },
    DeadLetter { reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    pub batch_timeout: Duration,
}

impl From<&DispatchConfig> for BatchSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            batch_timeout: config.batch_timeout(),
        }
    }
}

pub struct EmailDeliveryWorker {
    transport: Arc<dyn EmailTransport>,
    tokens: TokenService,
    links: LinkBuilder,
    policy: RetryPolicy,
    skip_domains: Vec<String>,
}

impl EmailDeliveryWorker {
    pub fn new(
        transport: Arc<dyn EmailTransport>,
        tokens: TokenService,
        links: LinkBuilder,
        policy: RetryPolicy,
        skip_domains: Vec<String>,
    ) -> Self {
        Self {
            transport,
            tokens,
            links,
            policy,
            skip_domains,
        }
    }

    /// Renders the verification email for a job. Deterministic for a given job.
    pub fn render(&self, delivery: &Delivery) -> Result<OutboundEmail, askama::Error> {
        let email = delivery.job.email.as_str();
        let unsubscribe_token = self.tokens.generate_unsubscribe_token(email);
        let unsubscribe_url = self.links.unsubscribe_url(email, &unsubscribe_token);
        let template = VerificationEmailTemplate {
            verify_url: self
                .links
                .verification_url(email, &delivery.job.verification_token),
            unsubscribe_url: unsubscribe_url.clone(),
        };

        Ok(OutboundEmail {
            to: email.to_owned(),
            subject: VERIFICATION_SUBJECT.to_owned(),
            html: template.render_html()?,
            text: template.render_text(),
            list_unsubscribe: Some(unsubscribe_url),
        })
    }

    #[tracing::instrument(skip_all, fields(job_id = %delivery.id, attempt = delivery.attempt))]
    pub async fn handle(&self, delivery: &Delivery) -> Outcome {
        let email = delivery.job.email.as_str();
        let domain = email.rsplit_once('@').map_or("", |(_, domain)| domain);

        if domain_matches_any(domain, &self.skip_domains) {
            tracing::debug!(
                name = "dispatch.handle.skipped",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                email = %MaskedEmail(email),
                message = "Recipient domain is filtered, acknowledging without sending"
            );
            return Outcome::Skip;
        }

        let message = match self.render(delivery) {
            Ok(message) => message,
            Err(e) => {
                return Outcome::DeadLetter {
                    reason: format!("template render failed: {e}"),
                };
            }
        };

        match self.transport.send(&message).await {
            Ok(()) => {
                tracing::info!(
                    name = "dispatch.handle.sent",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    email = %MaskedEmail(email),
                    message = "Sent verification email"
                );
                Outcome::Ack
            }
            Err(e) if e.is_permanent() => Outcome::DeadLetter {
                reason: format!("permanent provider failure: {e}"),
            },
            Err(e) if self.policy.should_retry(delivery.attempt) => {
                let delay = self.policy.delay_for(delivery.attempt);
                tracing::warn!(
                    name = "dispatch.handle.retry",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    email = %MaskedEmail(email),
                    error = %e,
                    delay_secs = delay.as_secs(),
                    remaining = self.policy.remaining_attempts(delivery.attempt),
                    message = "Verification email failed, scheduling retry"
                );
                Outcome::Retry {
                    delay,
                    error: e.to_string(),
                }
            }
            Err(e) => Outcome::DeadLetter {
                reason: format!(
                    "retries exhausted after {} attempts: {e}",
                    delivery.attempt
                ),
            },
        }
    }

    async fn apply(
        &self,
        source: &dyn JobSource,
        delivery: &Delivery,
        outcome: Outcome,
    ) -> Result<(), QueueError> {
        match outcome {
            Outcome::Ack | Outcome::Skip => source.ack(delivery).await,
            Outcome::Retry { delay, error } => source.retry(delivery, delay, &error).await,
            Outcome::DeadLetter { reason } => {
                tracing::error!(
                    name = "dispatch.dead_letter",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    job_id = %delivery.id,
                    email = %MaskedEmail(&delivery.job.email),
                    attempt = delivery.attempt,
                    reason = %reason,
                    message = "Verification email moved to dead-letter queue"
                );
                source.dead_letter(delivery, &reason).await
            }
        }
    }

    /// Handles every delivery of a batch concurrently and applies the outcomes.
    pub async fn process_batch(&self, source: &dyn JobSource, batch: Vec<Delivery>) {
        join_all(batch.iter().map(|delivery| async move {
            let outcome = self.handle(delivery).await;
            if let Err(e) = self.apply(source, delivery, outcome).await {
                // The lease runs out and the job is redelivered.
                tracing::error!(
                    name = "dispatch.apply.failed",
                    target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                    job_id = %delivery.id,
                    error = %e,
                    message = "Failed to record delivery outcome"
                );
            }
        }))
        .await;
    }

    /// Pulls and processes batches until `running` is cleared.
    pub async fn run(
        self: Arc<Self>,
        source: Arc<dyn JobSource>,
        settings: BatchSettings,
        running: Arc<AtomicBool>,
    ) {
        while running.load(Ordering::Relaxed) {
            match source
                .next_batch(settings.batch_size, settings.batch_timeout)
                .await
            {
                Ok(batch) if batch.is_empty() => {}
                Ok(batch) => {
                    tracing::debug!(
                        name = "dispatch.run.batch",
                        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                        size = batch.len(),
                        message = "Processing batch"
                    );
                    self.process_batch(source.as_ref(), batch).await;
                }
                Err(e) => {
                    tracing::error!(
                        name = "dispatch.run.next_batch_failed",
                        target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                        error = %e,
                        message = "Failed to pull batch from dispatch queue"
                    );
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
        }
    }
}

/// Starts `consumers` scheduler loops sharing one worker and one source.
pub fn spawn_consumers(
    worker: Arc<EmailDeliveryWorker>,
    source: Arc<dyn JobSource>,
    settings: BatchSettings,
    consumers: usize,
    running: Arc<AtomicBool>,
) -> Vec<JoinHandle<()>> {
    (0..consumers.max(1))
        .map(|_| {
            tokio::spawn(
                worker
                    .clone()
                    .run(source.clone(), settings, running.clone()),
            )
        })
        .collect()
}
