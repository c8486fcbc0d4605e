//! Outbound email transport.

use async_trait::async_trait;
use lettre::message::header::{ContentType, Header, HeaderName, HeaderValue, MIME_VERSION_1_0};
use lettre::message::{Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config::{ConfigError, SmtpConfig};
use crate::error::ProviderError;

/// A fully rendered message, independent of the transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    /// Target of the `List-Unsubscribe` header, if any.
    pub list_unsubscribe: Option<String>,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(&self, email: &OutboundEmail) -> Result<(), ProviderError>;
}

/// SMTP relay transport (STARTTLS/TLS via lettre's relay defaults).
pub struct SmtpEmailTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpEmailTransport {
    pub fn from_config(config: &SmtpConfig) -> Result<Self, ConfigError> {
        let from = config
            .from
            .parse::<Mailbox>()
            .map_err(|e| ConfigError::Validation(format!("smtp.from is not a mailbox: {e}")))?;

        let creds = Credentials::new(config.username.clone(), config.password.clone());
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::relay(&config.server)
            .map_err(|e| ConfigError::Validation(format!("smtp.server is not usable: {e}")))?
            .port(config.port)
            .credentials(creds)
            .timeout(Some(config.timeout()))
            .build();

        Ok(Self { mailer, from })
    }

    fn build_message(&self, email: &OutboundEmail) -> Result<Message, ProviderError> {
        let to = email
            .to
            .parse::<Mailbox>()
            .map_err(|e| ProviderError::InvalidMessage(format!("recipient: {e}")))?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .header(MIME_VERSION_1_0)
            .message_id(None);
        if let Some(url) = &email.list_unsubscribe {
            builder = builder
                .header(UnsubscribeHeader::from(format!("<{url}>")))
                .header(UnsubscribePostHeader::one_click());
        }

        builder
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(email.html.clone()),
                    ),
            )
            .map_err(|e| ProviderError::InvalidMessage(e.to_string()))
    }
}

#[async_trait]
impl EmailTransport for SmtpEmailTransport {
    #[tracing::instrument(skip_all)]
    async fn send(&self, email: &OutboundEmail) -> Result<(), ProviderError> {
        let message = self.build_message(email)?;
        match self.mailer.send(message).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_permanent() => Err(ProviderError::Rejected(e.to_string())),
            Err(e) => Err(ProviderError::Transport(e.to_string())),
        }
    }
}

/// `List-Unsubscribe` header (RFC 2369).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribeHeader(String);

impl Header for UnsubscribeHeader {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn core::error::Error + Send + Sync>> {
        Ok(Self(s.into()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

impl From<String> for UnsubscribeHeader {
    fn from(content: String) -> Self {
        Self(content)
    }
}

/// `List-Unsubscribe-Post` header (RFC 8058). The unsubscribe endpoint accepts POST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubscribePostHeader(String);

impl UnsubscribePostHeader {
    pub fn one_click() -> Self {
        Self("List-Unsubscribe=One-Click".into())
    }
}

impl Header for UnsubscribePostHeader {
    fn name() -> HeaderName {
        HeaderName::new_from_ascii_str("List-Unsubscribe-Post")
    }

    fn parse(s: &str) -> Result<Self, Box<dyn core::error::Error + Send + Sync>> {
        Ok(Self(s.into()))
    }

    fn display(&self) -> HeaderValue {
        HeaderValue::new(Self::name(), self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> SmtpEmailTransport {
        SmtpEmailTransport::from_config(&SmtpConfig {
            server: "smtp.example.net".into(),
            port: 587,
            username: "mailer".into(),
            password: "secret".into(),
            from: "Newsletter <newsletter@example.net>".into(),
            timeout_secs: 5,
        })
        .unwrap()
    }

    fn email(to: &str) -> OutboundEmail {
        OutboundEmail {
            to: to.into(),
            subject: "Confirm".into(),
            html: "<p>hi</p>".into(),
            text: "hi".into(),
            list_unsubscribe: Some("https://api.example.net/v1/newsletter/unsubscribe?token=t".into()),
        }
    }

    // The pooled transport spawns onto the runtime when built.
    #[tokio::test]
    async fn message_carries_unsubscribe_headers() {
        let message = transport().build_message(&email("a@x.com")).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();
        assert!(raw.contains(
            "List-Unsubscribe: <https://api.example.net/v1/newsletter/unsubscribe?token=t>"
        ));
        assert!(raw.contains("List-Unsubscribe-Post: List-Unsubscribe=One-Click"));
        assert!(raw.contains("multipart/alternative"));
    }

    #[tokio::test]
    async fn invalid_recipient_is_permanent() {
        let err = transport().build_message(&email("not an address")).unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn invalid_sender_is_a_config_error() {
        let result = SmtpEmailTransport::from_config(&SmtpConfig {
            server: "smtp.example.net".into(),
            port: 587,
            username: "u".into(),
            password: "p".into(),
            from: "nope".into(),
            timeout_secs: 5,
        });
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
