//! HMAC proof tokens for email verification and unsubscribe links.
//!
//! * Verification token: `base64url("<hex hmac(email:issuedAtMillis)>:<issuedAtMillis>")`.
//!   A fresh one is issued on every subscribe; the store only accepts the latest.
//! * Unsubscribe token: `base64url("<hex hmac(email)>")`. It carries no timestamp, so it is
//!   stable for a given `(email, secret)` pair and links in old newsletters keep working.
//!   The encoding matches what the bulk sender script puts into newsletter footers.
//!
//! Verification never says *why* a token was rejected; callers only see `false`.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::config::TokenConfig;

type HmacSha256 = Hmac<Sha256>;

/// Padded URL-safe alphabet on encode; accepts tokens whose padding was stripped.
const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Tolerated clock skew for tokens stamped slightly in the future.
const MAX_FUTURE_SKEW_MILLIS: i64 = 5 * 60 * 1000;

#[derive(Clone)]
pub struct TokenService {
    mac: HmacSha256,
    verification_ttl: Option<Duration>,
}

impl TokenService {
    pub fn new(secret: &[u8]) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self {
            mac: HmacSha256::new_from_slice(secret)?,
            verification_ttl: None,
        })
    }

    pub fn from_config(config: &TokenConfig) -> Result<Self, hmac::digest::InvalidLength> {
        Ok(Self::new(config.hmac_secret.as_bytes())?
            .with_verification_ttl(config.verification_token_ttl()))
    }

    /// Sets the maximum accepted age of verification tokens. `None` disables expiry.
    pub fn with_verification_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.verification_ttl = ttl;
        self
    }

    pub fn verification_ttl(&self) -> Option<Duration> {
        self.verification_ttl
    }

    pub fn generate_verification_token(&self, email: &str) -> String {
        self.generate_verification_token_at(email, now_millis())
    }

    pub fn generate_verification_token_at(&self, email: &str, issued_at_millis: i64) -> String {
        let signature = self.sign(format!("{email}:{issued_at_millis}").as_bytes());
        TOKEN_ENGINE.encode(format!("{signature}:{issued_at_millis}"))
    }

    pub fn verify_verification_token(&self, email: &str, token: &str) -> bool {
        self.verify_verification_token_at(email, token, now_millis())
    }

    pub fn verify_verification_token_at(&self, email: &str, token: &str, now_millis: i64) -> bool {
        let Some((signature, issued_at_millis)) = decode_verification_token(token) else {
            return false;
        };

        if let Some(ttl) = self.verification_ttl {
            let age = now_millis.saturating_sub(issued_at_millis);
            let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
            if age > ttl_millis || age < -MAX_FUTURE_SKEW_MILLIS {
                return false;
            }
        }

        let expected = self.sign(format!("{email}:{issued_at_millis}").as_bytes());
        constant_time_eq(expected.as_bytes(), signature.as_bytes())
    }

    pub fn generate_unsubscribe_token(&self, email: &str) -> String {
        TOKEN_ENGINE.encode(self.sign(email.as_bytes()))
    }

    pub fn verify_unsubscribe_token(&self, email: &str, token: &str) -> bool {
        let Ok(decoded) = TOKEN_ENGINE.decode(token.trim()) else {
            return false;
        };
        let expected = self.sign(email.as_bytes());
        constant_time_eq(expected.as_bytes(), &decoded)
    }

    fn sign(&self, message: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(message);
        hex::encode(mac.finalize().into_bytes())
    }
}

/// Splits a decoded verification token into `(hex signature, issuedAtMillis)`.
fn decode_verification_token(token: &str) -> Option<(String, i64)> {
    let decoded = TOKEN_ENGINE.decode(token.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (signature, issued_at) = decoded.rsplit_once(':')?;
    if signature.is_empty() {
        return None;
    }
    let issued_at = issued_at.parse::<i64>().ok()?;
    Some((signature.to_owned(), issued_at))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    i64::try_from(nanos).unwrap_or(i64::MAX)
}
