use serde::{Deserialize, Serialize};

use super::email::EmailAddress;
use crate::error::ValidationError;

/// Longest stored user agent; anything beyond is cut.
const MAX_USER_AGENT_LEN: usize = 512;

/// Best-effort request context captured at subscribe time. Not authoritative.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

impl RequestMetadata {
    /// Trims values, drops empty ones and caps the user agent length.
    pub fn normalized(self) -> Self {
        Self {
            ip_address: non_empty(self.ip_address),
            user_agent: non_empty(self.user_agent)
                .map(|ua| ua.chars().take(MAX_USER_AGENT_LEN).collect()),
            country: non_empty(self.country),
            city: non_empty(self.city),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required_token(raw: Option<&str>, missing: ValidationError) -> Result<String, ValidationError> {
    match raw.map(str::trim) {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(missing),
    }
}

fn required_email(raw: Option<&str>) -> Result<EmailAddress, ValidationError> {
    EmailAddress::parse(raw.ok_or(ValidationError::MissingEmail)?)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeRequest {
    pub email: EmailAddress,
    /// Trimmed challenge response. Empty when the client sent none; that is a failed
    /// bot check, not a malformed request.
    pub bot_token: String,
}

impl SubscribeRequest {
    pub fn new(email: Option<&str>, bot_token: Option<&str>) -> Result<Self, ValidationError> {
        Ok(Self {
            email: required_email(email)?,
            bot_token: bot_token.map(str::trim).unwrap_or_default().to_string(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifyRequest {
    pub email: EmailAddress,
    pub token: String,
}

impl VerifyRequest {
    pub fn new(email: Option<&str>, token: Option<&str>) -> Result<Self, ValidationError> {
        Ok(Self {
            email: required_email(email)?,
            token: required_token(token, ValidationError::MissingToken)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnsubscribeRequest {
    pub email: EmailAddress,
    pub token: String,
}

impl UnsubscribeRequest {
    pub fn new(email: Option<&str>, token: Option<&str>) -> Result<Self, ValidationError> {
        Ok(Self {
            email: required_email(email)?,
            token: required_token(token, ValidationError::MissingToken)?,
        })
    }
}
