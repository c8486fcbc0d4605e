use hyper::StatusCode;
use sea_orm::DbErr;
use thiserror::Error;

/// Malformed or missing input, caught before any collaborator is called.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Email address is required")]
    MissingEmail,
    #[error("Email address is not valid")]
    InvalidEmail,
    #[error("Token is required")]
    MissingToken,
    #[error("Request body is not valid: {0}")]
    MalformedBody(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Subscriber not found")]
    NotFound,
    /// Covers malformed, mismatched, superseded and expired tokens alike.
    #[error("Invalid or expired token")]
    TokenInvalid,
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] DbErr),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Storage(#[from] DbErr),
    #[error("Queue payload error: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("Delay of {0:?} does not fit in a timestamp")]
    ScheduleOverflow(std::time::Duration),
}

/// The dispatch queue refused a job after the subscriber row was committed.
#[derive(Debug, Error)]
#[error("Failed to enqueue verification job: {0}")]
pub struct EnqueueFailed(pub String);

impl From<QueueError> for EnqueueFailed {
    fn from(e: QueueError) -> Self {
        EnqueueFailed(e.to_string())
    }
}

/// Failure reported by the email transport. Never reaches HTTP callers.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Message could not be built: {0}")]
    InvalidMessage(String),
    #[error("Message rejected by provider: {0}")]
    Rejected(String),
    #[error("Transport failure: {0}")]
    Transport(String),
}

impl ProviderError {
    /// Permanent failures will not succeed on redelivery.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ProviderError::InvalidMessage(_) | ProviderError::Rejected(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum BotGateError {
    #[error("Bot verification request failed: {0}")]
    Request(String),
    #[error("Bot verification timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Bot verification service returned HTTP {0}")]
    Status(StatusCode),
    #[error("Bot verification response is not valid: {0}")]
    InvalidResponse(String),
}

/// Caller-facing failures of the subscription use cases.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// `help_url` points the visitor at troubleshooting steps for the challenge.
    #[error("Bot verification failed")]
    BotCheckFailed { help_url: Option<String> },
    #[error("Invalid or expired token")]
    TokenInvalid,
    #[error("Subscriber not found")]
    NotFound,
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(DbErr),
    #[error(transparent)]
    DispatchUnavailable(#[from] EnqueueFailed),
}

impl From<StoreError> for SubscriptionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound => SubscriptionError::NotFound,
            StoreError::TokenInvalid => SubscriptionError::TokenInvalid,
            StoreError::StorageUnavailable(db) => SubscriptionError::StorageUnavailable(db),
        }
    }
}

impl SubscriptionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            SubscriptionError::Validation(_)
            | SubscriptionError::BotCheckFailed { .. }
            | SubscriptionError::TokenInvalid => StatusCode::BAD_REQUEST,
            SubscriptionError::NotFound => StatusCode::NOT_FOUND,
            SubscriptionError::StorageUnavailable(_) | SubscriptionError::DispatchUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    /// Stable machine-readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SubscriptionError::Validation(_) => "validation_error",
            SubscriptionError::BotCheckFailed { .. } => "bot_check_failed",
            SubscriptionError::TokenInvalid => "token_invalid",
            SubscriptionError::NotFound => "not_found",
            SubscriptionError::StorageUnavailable(_) => "storage_unavailable",
            SubscriptionError::DispatchUnavailable(_) => "dispatch_unavailable",
        }
    }

    /// Message safe to return to the caller. Storage and queue details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            SubscriptionError::Validation(v) => v.to_string(),
            SubscriptionError::BotCheckFailed { .. } => {
                "Bot verification failed. Please reload the page and try again.".to_string()
            }
            SubscriptionError::TokenInvalid => "Invalid or expired link.".to_string(),
            SubscriptionError::NotFound => "Subscription not found.".to_string(),
            SubscriptionError::StorageUnavailable(_) | SubscriptionError::DispatchUnavailable(_) => {
                "Service temporarily unavailable. Please try again later.".to_string()
            }
        }
    }

    /// Troubleshooting link for errors the visitor can fix themselves.
    pub fn help_url(&self) -> Option<&str> {
        match self {
            SubscriptionError::BotCheckFailed { help_url } => help_url.as_deref(),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SubscriptionError::StorageUnavailable(_) | SubscriptionError::DispatchUnavailable(_)
        )
    }
}
