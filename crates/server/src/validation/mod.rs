//! Boundary validation: raw request input becomes typed requests here, before it
//! reaches the subscription service.

pub mod email;
pub mod requests;

pub use email::{EmailAddress, domain_matches_any};
pub use requests::{RequestMetadata, SubscribeRequest, UnsubscribeRequest, VerifyRequest};
