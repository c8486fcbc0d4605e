use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Minimum accepted length of the HMAC secret, in bytes.
pub const MIN_SECRET_LEN: usize = 32;

/// Upper bound for queue delays (lease and retry backoff): 30 days.
pub const MAX_QUEUE_DELAY_SECS: u64 = 30 * 24 * 60 * 60;

/// Environment variable naming an alternative configuration file.
pub const CONFIG_PATH_ENV: &str = "NEWSLETTER_CONFIG";

pub const DEFAULT_TURNSTILE_VERIFY_URL: &str =
    "https://challenges.cloudflare.com/turnstile/v0/siteverify";

pub const DEFAULT_BOT_GATE_HELP_URL: &str =
    "https://developers.cloudflare.com/turnstile/troubleshooting/";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration build error: {0}")]
    Build(#[from] config::ConfigError),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Clone, Deserialize)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
    #[serde(default = "default_smtp_timeout_secs")]
    pub timeout_secs: u64,
}

impl SmtpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Secrets and policy for proof tokens.
#[derive(Clone, Deserialize)]
pub struct TokenConfig {
    pub hmac_secret: String,
    /// Maximum age of a verification token. Unset means verification links never expire,
    /// which mirrors the unsubscribe token.
    #[serde(default)]
    pub verification_token_ttl_secs: Option<u64>,
}

impl TokenConfig {
    pub fn verification_token_ttl(&self) -> Option<Duration> {
        self.verification_token_ttl_secs.map(Duration::from_secs)
    }
}

/// Turnstile (bot challenge) settings.
#[derive(Clone, Deserialize)]
pub struct BotGateConfig {
    pub secret_key: String,
    #[serde(default = "default_turnstile_verify_url")]
    pub verify_url: String,
    #[serde(default = "default_bot_gate_timeout_secs")]
    pub timeout_secs: u64,
    /// Returned with failed bot checks so visitors can find out what went wrong.
    #[serde(default = "default_bot_gate_help_url")]
    pub help_url: Option<String>,
}

impl BotGateConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// Jobs live in the `dispatch_job` table and survive restarts.
    #[default]
    Database,
    /// Jobs live in process memory; intended for development.
    Memory,
}

/// Verification email dispatch settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub backend: QueueBackend,
    /// Number of concurrent batch consumers.
    pub consumers: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    /// Delivery attempts before a job is moved to the dead-letter table.
    pub max_retries: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    /// How long a claimed job stays invisible to other consumers.
    pub visibility_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Recipient domains that are acknowledged without sending (load tests, internal checks).
    pub skip_domains: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            consumers: 2,
            batch_size: 10,
            batch_timeout_ms: 5_000,
            max_retries: 3,
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 3_600,
            visibility_timeout_secs: 300,
            poll_interval_ms: 500,
            skip_domains: vec![
                "example.com".into(),
                "example.net".into(),
                "example.org".into(),
                "test".into(),
                "invalid".into(),
            ],
        }
    }
}

impl DispatchConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    /// Apply pending schema migrations on startup.
    #[serde(default)]
    pub run_migrations: bool,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Public base URL of this API, used to build verify and unsubscribe links.
    pub public_base_url: String,
    pub token: TokenConfig,
    pub smtp: SmtpConfig,
    pub bot_gate: BotGateConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
}

impl AppConfig {
    /// Checks the invariants the rest of the service relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.token.hmac_secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::Validation(format!(
                "token.hmac_secret must be at least {MIN_SECRET_LEN} bytes"
            )));
        }
        if self.token.verification_token_ttl_secs == Some(0) {
            return Err(ConfigError::Validation(
                "token.verification_token_ttl_secs must be > 0 when set".into(),
            ));
        }
        if self.smtp.port == 0 {
            return Err(ConfigError::Validation("smtp.port must be > 0".into()));
        }
        if self.bot_gate.secret_key.trim().is_empty() {
            return Err(ConfigError::Validation(
                "bot_gate.secret_key must not be empty".into(),
            ));
        }
        if url::Url::parse(&self.public_base_url).is_err() {
            return Err(ConfigError::Validation(format!(
                "public_base_url is not a valid URL: {}",
                self.public_base_url
            )));
        }
        if self.dispatch.max_retries == 0 {
            return Err(ConfigError::Validation(
                "dispatch.max_retries must be >= 1".into(),
            ));
        }
        if self.dispatch.batch_size == 0 {
            return Err(ConfigError::Validation(
                "dispatch.batch_size must be >= 1".into(),
            ));
        }
        if self.dispatch.consumers == 0 {
            return Err(ConfigError::Validation(
                "dispatch.consumers must be >= 1".into(),
            ));
        }
        if self.dispatch.retry_base_delay_secs > self.dispatch.retry_max_delay_secs {
            return Err(ConfigError::Validation(
                "dispatch.retry_base_delay_secs must not exceed dispatch.retry_max_delay_secs"
                    .into(),
            ));
        }
        if self.dispatch.visibility_timeout_secs > MAX_QUEUE_DELAY_SECS
            || self.dispatch.retry_max_delay_secs > MAX_QUEUE_DELAY_SECS
        {
            return Err(ConfigError::Validation(format!(
                "dispatch.visibility_timeout_secs and dispatch.retry_max_delay_secs must not exceed {MAX_QUEUE_DELAY_SECS}"
            )));
        }
        // A lease is taken while a batch is still filling and held through the send.
        let lease_needed = self
            .dispatch
            .batch_timeout()
            .checked_add(self.smtp.timeout())
            .unwrap_or(Duration::MAX);
        if self.dispatch.visibility_timeout() <= lease_needed {
            return Err(ConfigError::Validation(format!(
                "dispatch.visibility_timeout_secs must exceed dispatch.batch_timeout_ms plus smtp.timeout_secs ({}s)",
                lease_needed.as_secs_f64()
            )));
        }
        Ok(())
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_smtp_timeout_secs() -> u64 {
    30
}

fn default_turnstile_verify_url() -> String {
    DEFAULT_TURNSTILE_VERIFY_URL.to_string()
}

fn default_bot_gate_timeout_secs() -> u64 {
    10
}

fn default_bot_gate_help_url() -> Option<String> {
    Some(DEFAULT_BOT_GATE_HELP_URL.to_string())
}

/// Load application configuration from `config.yaml` (or the file named by
/// `NEWSLETTER_CONFIG`) + environment overrides.
///
/// Any environment variable matching the key path separated by double underscores
/// (e.g. `SMTP__PASSWORD`, `TOKEN__HMAC_SECRET`) overrides the file value. A `.env`
/// file is read first when present.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| "config.yaml".to_string());
    load_config_from(&path)
}

/// Same as [`load_config`] with an explicit file path. The file is optional so a
/// deployment can be configured from the environment alone.
pub fn load_config_from(path: &str) -> Result<AppConfig, ConfigError> {
    use config::{Config, Environment, File};

    match dotenvy::dotenv() {
        Ok(_) => {}
        Err(e) if e.not_found() => {}
        Err(e) => return Err(ConfigError::Validation(format!("failed to read .env: {e}"))),
    }

    let cfg = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(Environment::default().separator("__"))
        .build()?;

    let app: AppConfig = cfg.try_deserialize()?;
    app.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .expect("build config")
            .try_deserialize()
            .expect("deserialize config")
    }

    const MINIMAL: &str = r#"
database_url: "sqlite::memory:"
public_base_url: "https://api.example.net"
token:
  hmac_secret: "0123456789abcdef0123456789abcdef"
smtp:
  server: "smtp.example.net"
  port: 587
  username: "mailer"
  password: "hunter2"
  from: "Newsletter <newsletter@example.net>"
bot_gate:
  secret_key: "1x0000000000000000000000000000000AA"
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = parse(MINIMAL);
        cfg.validate().expect("valid");
        assert_eq!(cfg.listen_addr, default_listen_addr());
        assert!(!cfg.run_migrations);
        assert_eq!(cfg.dispatch.backend, QueueBackend::Database);
        assert_eq!(cfg.dispatch.max_retries, 3);
        assert_eq!(cfg.bot_gate.verify_url, DEFAULT_TURNSTILE_VERIFY_URL);
        assert_eq!(cfg.bot_gate.help_url.as_deref(), Some(DEFAULT_BOT_GATE_HELP_URL));
        assert_eq!(cfg.token.verification_token_ttl(), None);
        assert_eq!(cfg.smtp.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn short_secret_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.token.hmac_secret = "too-short".into();
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn zero_retry_budget_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.dispatch.max_retries = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn lease_shorter_than_batch_and_send_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.dispatch.batch_timeout_ms = 5_000;
        cfg.smtp.timeout_secs = 30;
        cfg.dispatch.visibility_timeout_secs = 35;
        assert!(matches!(cfg.validate(), Err(ConfigError::Validation(_))));

        cfg.dispatch.visibility_timeout_secs = 36;
        cfg.validate().expect("lease covers batch wait and send");
    }

    #[test]
    fn oversized_queue_delays_are_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.dispatch.visibility_timeout_secs = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = parse(MINIMAL);
        cfg.dispatch.retry_max_delay_secs = MAX_QUEUE_DELAY_SECS + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.token.verification_token_ttl_secs = Some(0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn dispatch_section_overrides() {
        let yaml = format!(
            "{MINIMAL}dispatch:\n  backend: memory\n  batch_size: 25\n  skip_domains: [\"internal.test\"]\n"
        );
        let cfg = parse(&yaml);
        assert_eq!(cfg.dispatch.backend, QueueBackend::Memory);
        assert_eq!(cfg.dispatch.batch_size, 25);
        assert_eq!(cfg.dispatch.consumers, 2);
        assert_eq!(cfg.dispatch.skip_domains, vec!["internal.test".to_string()]);
    }
}
