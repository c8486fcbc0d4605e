//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use newsletter::bot_gate::BotGate;
use newsletter::dispatch::{DispatchQueue, VerificationJob};
use newsletter::error::{BotGateError, EnqueueFailed, ProviderError};
use newsletter::mailer::{EmailTransport, OutboundEmail};
use newsletter::token::TokenService;
use newsletter::validation::{EmailAddress, RequestMetadata};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DbBackend, Statement};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

pub const SECRET: &str = "0123456789abcdef0123456789abcdef";
pub const BASE_URL: &str = "https://api.newsletter.dev";

/// In-memory SQLite with the production tables.
pub async fn create_test_db() -> Arc<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await.expect("connect");

    for statement in [
        r#"CREATE TABLE subscriber (
            email TEXT PRIMARY KEY NOT NULL,
            email_verified BOOLEAN NOT NULL DEFAULT FALSE,
            verification_token TEXT NULL,
            verification_sent_at TEXT NULL,
            verified_at TEXT NULL,
            unsubscribed_at TEXT NULL,
            subscribed_at TEXT NOT NULL,
            ip_address TEXT NULL,
            user_agent TEXT NULL,
            country TEXT NULL,
            city TEXT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );"#,
        r#"CREATE TABLE dispatch_job (
            id TEXT PRIMARY KEY NOT NULL,
            payload TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            available_at TEXT NOT NULL,
            last_error TEXT NULL,
            created_at TEXT NOT NULL
        );"#,
        r#"CREATE TABLE dead_letter_job (
            id TEXT PRIMARY KEY NOT NULL,
            payload TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            last_error TEXT NULL,
            enqueued_at TEXT NOT NULL,
            dead_lettered_at TEXT NOT NULL
        );"#,
    ] {
        db.execute(Statement::from_string(DbBackend::Sqlite, statement))
            .await
            .expect("create table");
    }

    Arc::new(db)
}

pub fn tokens() -> TokenService {
    TokenService::new(SECRET.as_bytes()).expect("token service")
}

pub fn email(raw: &str) -> EmailAddress {
    EmailAddress::parse(raw).expect("valid email")
}

pub fn metadata() -> RequestMetadata {
    RequestMetadata {
        ip_address: Some("203.0.113.7".into()),
        user_agent: Some("integration-test".into()),
        country: Some("DE".into()),
        city: None,
    }
}

/// Bot gate with a fixed answer.
pub struct StaticBotGate {
    answer: Result<bool, ()>,
    pub calls: AtomicUsize,
}

impl StaticBotGate {
    pub fn accepting() -> Self {
        Self {
            answer: Ok(true),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            answer: Ok(false),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            answer: Err(()),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BotGate for StaticBotGate {
    async fn verify(
        &self,
        _response: &str,
        _remote_ip: Option<&str>,
    ) -> Result<bool, BotGateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .map_err(|()| BotGateError::Request("connection refused".into()))
    }
}

/// Queue that records jobs, or refuses them.
#[derive(Default)]
pub struct RecordingQueue {
    pub jobs: Mutex<Vec<VerificationJob>>,
    pub refuse: bool,
}

impl RecordingQueue {
    pub fn refusing() -> Self {
        Self {
            jobs: Mutex::default(),
            refuse: true,
        }
    }
}

#[async_trait]
impl DispatchQueue for RecordingQueue {
    async fn enqueue(&self, job: VerificationJob) -> Result<(), EnqueueFailed> {
        if self.refuse {
            return Err(EnqueueFailed("queue offline".into()));
        }
        self.jobs.lock().await.push(job);
        Ok(())
    }
}

/// How a [`ScriptedTransport`] answers one send.
#[derive(Clone, Copy, Debug)]
pub enum Reply {
    Ok,
    Transient,
    Permanent,
}

/// Transport that replays scripted replies (then succeeds) and keeps what it was given.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    pub sent: Mutex<Vec<OutboundEmail>>,
    pub calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn always(reply: Reply, times: usize) -> Self {
        Self::new(std::iter::repeat_n(reply, times))
    }
}

#[async_trait]
impl EmailTransport for ScriptedTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<(), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.replies.lock().await.pop_front().unwrap_or(Reply::Ok);
        match reply {
            Reply::Ok => {
                self.sent.lock().await.push(email.clone());
                Ok(())
            }
            Reply::Transient => Err(ProviderError::Transport("connection reset".into())),
            Reply::Permanent => Err(ProviderError::Rejected("550 mailbox unavailable".into())),
        }
    }
}
