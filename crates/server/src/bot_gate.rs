//! Bot challenge verification (Cloudflare Turnstile).

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, USER_AGENT};
use hyper::{Method, Request};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use std::time::Duration;
use tokio::time::timeout;

use crate::config::BotGateConfig;
use crate::error::BotGateError;

#[async_trait]
pub trait BotGate: Send + Sync {
    /// `Ok(false)` means the challenge response was checked and rejected.
    async fn verify(
        &self,
        response: &str,
        remote_ip: Option<&str>,
    ) -> Result<bool, BotGateError>;
}

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Posts `secret`, `response` and `remoteip` to the siteverify endpoint.
pub struct TurnstileBotGate {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    secret_key: String,
    verify_url: hyper::Uri,
    timeout: Duration,
}

impl TurnstileBotGate {
    pub fn new(config: &BotGateConfig) -> Result<Self, BotGateError> {
        let verify_url = config
            .verify_url
            .parse::<hyper::Uri>()
            .map_err(|e| BotGateError::Request(format!("invalid verify_url: {e}")))?;

        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(config.timeout()));
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .wrap_connector(http);

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(https),
            secret_key: config.secret_key.clone(),
            verify_url,
            timeout: config.timeout(),
        })
    }

    async fn call(&self, body: String) -> Result<SiteVerifyResponse, BotGateError> {
        let request = Request::builder()
            .method(Method::POST)
            .uri(self.verify_url.clone())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(USER_AGENT, concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| BotGateError::Request(e.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| BotGateError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BotGateError::Status(status));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| BotGateError::Request(e.to_string()))?
            .to_bytes();

        serde_json::from_slice(&body).map_err(|e| BotGateError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl BotGate for TurnstileBotGate {
    #[tracing::instrument(skip_all)]
    async fn verify(
        &self,
        response: &str,
        remote_ip: Option<&str>,
    ) -> Result<bool, BotGateError> {
        let response = response.trim();
        if response.is_empty() {
            return Ok(false);
        }

        // The serializer is not Send; it must be gone before the first await.
        let body = {
            let mut form = url::form_urlencoded::Serializer::new(String::new());
            form.append_pair("secret", &self.secret_key)
                .append_pair("response", response);
            if let Some(ip) = remote_ip {
                form.append_pair("remoteip", ip);
            }
            form.finish()
        };

        let outcome = timeout(self.timeout, self.call(body))
            .await
            .map_err(|_| BotGateError::Timeout(self.timeout))??;

        if !outcome.success {
            tracing::info!(
                name = "bot_gate.verify.rejected",
                target = concat!(env!("CARGO_PKG_NAME"), "::", module_path!()),
                error_codes = ?outcome.error_codes,
                message = "Turnstile rejected the challenge response"
            );
        }
        Ok(outcome.success)
    }
}
