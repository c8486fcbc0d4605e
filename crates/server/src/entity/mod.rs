//! SeaORM entities for the tables created by the `migration` crate.

pub mod dead_letter_job;
pub mod dispatch_job;
pub mod subscriber;
