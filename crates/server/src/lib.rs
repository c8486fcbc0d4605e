//! Double opt-in newsletter subscriptions.
//!
//! Visitors subscribe through a bot-checked endpoint, prove ownership of their address
//! by following an HMAC-signed link, and can leave again through a stable unsubscribe
//! link. Verification emails are sent asynchronously from a retry-safe dispatch queue
//! with a dead-letter table for jobs that keep failing.

pub mod api;
pub mod bot_gate;
pub mod config;
pub mod dispatch;
pub mod email_templates;
pub mod entity;
pub mod error;
pub mod links;
pub mod logging;
pub mod mailer;
pub mod service;
pub mod store;
pub mod token;
pub mod validation;
