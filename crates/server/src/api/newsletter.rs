//! Newsletter subscription endpoints (`/v1/newsletter/*`).
//!
//! - `/subscribe` - start (or restart) a double opt-in subscription
//! - `/verify` - confirm ownership of the address
//! - `/unsubscribe` - leave the list; also the `List-Unsubscribe` target

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{ConnectInfo, FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

use super::AppState;
use crate::error::{SubscriptionError, ValidationError};
use crate::service::{ActionResponse, SubscribeResponse};
use crate::validation::{RequestMetadata, SubscribeRequest, UnsubscribeRequest, VerifyRequest};

/// Tag for OpenAPI documentation.
pub const NEWSLETTER_TAG: &str = "Newsletter API";

const CF_CONNECTING_IP: HeaderName = HeaderName::from_static("cf-connecting-ip");
const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const CF_IPCOUNTRY: HeaderName = HeaderName::from_static("cf-ipcountry");
const CF_IPCITY: HeaderName = HeaderName::from_static("cf-ipcity");

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct SubscribeBody {
    email: Option<String>,
    /// Turnstile challenge response.
    #[serde(rename = "botToken", alias = "cf-turnstile-response")]
    bot_token: Option<String>,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct TokenParams {
    token: Option<String>,
    email: Option<String>,
}

/// Error body shared by all newsletter endpoints.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    pub code: String,
    /// Troubleshooting link, present for failed bot checks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help_url: Option<String>,
}

impl IntoResponse for SubscriptionError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            success: false,
            error: self.public_message(),
            code: self.code().to_string(),
            help_url: self.help_url().map(str::to_owned),
        };
        (self.status_code(), Json(body)).into_response()
    }
}

/// Best-effort client context from proxy headers and the socket.
#[derive(Debug, Clone, Default)]
pub struct ClientMetadata(pub RequestMetadata);

impl ClientMetadata {
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let header = |name: &HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };

        let forwarded_for = header(&X_FORWARDED_FOR)
            .and_then(|v| v.split(',').next().map(|ip| ip.trim().to_owned()));
        let ip_address = header(&CF_CONNECTING_IP)
            .or(forwarded_for)
            .or_else(|| peer.map(|addr| addr.ip().to_string()));

        Self(
            RequestMetadata {
                ip_address,
                user_agent: header(&axum::http::header::USER_AGENT),
                country: header(&CF_IPCOUNTRY),
                city: header(&CF_IPCITY),
            }
            .normalized(),
        )
    }
}

impl<S> FromRequestParts<S> for ClientMetadata
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(Self::from_headers(&parts.headers, peer))
    }
}

/// Creates the newsletter API router.
pub fn router() -> OpenApiRouter<AppState> {
    OpenApiRouter::new()
        .routes(routes!(subscribe))
        .routes(routes!(verify))
        .routes(routes!(unsubscribe))
}

fn token_params(
    params: Result<Query<TokenParams>, QueryRejection>,
) -> Result<TokenParams, ValidationError> {
    params
        .map(|Query(params)| params)
        .map_err(|e| ValidationError::MalformedBody(e.body_text()))
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/subscribe",
    operation_id = "Subscribe",
    tag = NEWSLETTER_TAG,
    summary = "Subscribe an email address",
    description = "Checks the bot challenge, stores the address as unverified with a fresh token \
                   and queues a verification email. The response is the same whether the address \
                   was unknown, verified or unsubscribed before.",
    request_body = SubscribeBody,
    responses(
        (status = 200, description = "Verification email queued", body = SubscribeResponse),
        (status = 400, description = "Invalid input or failed bot check", body = ErrorBody),
        (status = 503, description = "Storage or queue unavailable", body = ErrorBody)
    )
)]
pub async fn subscribe(
    State(state): State<AppState>,
    ClientMetadata(metadata): ClientMetadata,
    body: Result<Json<SubscribeBody>, JsonRejection>,
) -> Result<Json<SubscribeResponse>, SubscriptionError> {
    let Json(body) = body.map_err(|e| ValidationError::MalformedBody(e.body_text()))?;
    let request = SubscribeRequest::new(body.email.as_deref(), body.bot_token.as_deref())?;
    let response = state.service.subscribe(request, metadata).await?;
    Ok(Json(response))
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    method(get, post),
    path = "/verify",
    operation_id = "Verify",
    tag = NEWSLETTER_TAG,
    summary = "Confirm a subscription",
    params(TokenParams),
    responses(
        (status = 200, description = "Subscription verified (or already verified)", body = ActionResponse),
        (status = 400, description = "Missing input or invalid token", body = ErrorBody),
        (status = 404, description = "Unknown email", body = ErrorBody),
        (status = 503, description = "Storage unavailable", body = ErrorBody)
    )
)]
pub async fn verify(
    State(state): State<AppState>,
    params: Result<Query<TokenParams>, QueryRejection>,
) -> Result<Json<ActionResponse>, SubscriptionError> {
    let params = token_params(params)?;
    let request = VerifyRequest::new(params.email.as_deref(), params.token.as_deref())?;
    Ok(Json(state.service.verify(request).await?))
}

#[tracing::instrument(skip_all)]
#[utoipa::path(
    method(get, post),
    path = "/unsubscribe",
    operation_id = "Unsubscribe",
    tag = NEWSLETTER_TAG,
    summary = "Unsubscribe an email address",
    description = "Target of the unsubscribe link and of one-click `List-Unsubscribe-Post` requests.",
    params(TokenParams),
    responses(
        (status = 200, description = "Unsubscribed (or already unsubscribed)", body = ActionResponse),
        (status = 400, description = "Missing input or invalid token", body = ErrorBody),
        (status = 404, description = "Unknown email", body = ErrorBody),
        (status = 503, description = "Storage unavailable", body = ErrorBody)
    )
)]
pub async fn unsubscribe(
    State(state): State<AppState>,
    params: Result<Query<TokenParams>, QueryRejection>,
) -> Result<Json<ActionResponse>, SubscriptionError> {
    let params = token_params(params)?;
    let request = UnsubscribeRequest::new(params.email.as_deref(), params.token.as_deref())?;
    Ok(Json(state.service.unsubscribe(request).await?))
}
