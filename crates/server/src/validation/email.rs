use std::fmt;

use crate::error::ValidationError;

/// Longest address accepted (RFC 5321 path limit minus the angle brackets).
pub const MAX_EMAIL_LEN: usize = 254;

/// A syntactically valid, normalized (trimmed, lower-cased) email address.
///
/// The normalized form is the subscriber key and the value bound into tokens.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EmailAddress(String);

impl EmailAddress {
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(ValidationError::MissingEmail);
        }
        if normalized.len() > MAX_EMAIL_LEN || normalized.chars().any(char::is_whitespace) {
            return Err(ValidationError::InvalidEmail);
        }

        let address = normalized
            .parse::<lettre::Address>()
            .map_err(|_| ValidationError::InvalidEmail)?;

        // Require a dotted domain; bare hosts and IP literals are not newsletter recipients.
        let domain = address.domain();
        if !domain.contains('.')
            || domain.starts_with('.')
            || domain.ends_with('.')
            || domain.starts_with('[')
        {
            return Err(ValidationError::InvalidEmail);
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn domain(&self) -> &str {
        self.0.rsplit_once('@').map(|(_, d)| d).unwrap_or_default()
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for EmailAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether `domain` equals one of `patterns` or is a subdomain of one.
pub fn domain_matches_any(domain: &str, patterns: &[String]) -> bool {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    patterns.iter().any(|pattern| {
        let pattern = pattern.trim().trim_start_matches('.').to_ascii_lowercase();
        !pattern.is_empty()
            && (domain == pattern
                || domain
                    .strip_suffix(&pattern)
                    .is_some_and(|rest| rest.ends_with('.')))
    })
}
