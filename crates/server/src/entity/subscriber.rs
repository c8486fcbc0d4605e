//! One row per normalized email address.
//!
//! The lifecycle state is never stored; [`Model::state`] derives it from
//! `email_verified` and `unsubscribed_at`.

use sea_orm::entity::prelude::*;
use serde::Serialize;
use time::OffsetDateTime;

use crate::validation::RequestMetadata;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "subscriber")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub email: String,
    pub email_verified: bool,
    pub verification_token: Option<String>,
    pub verification_sent_at: Option<OffsetDateTime>,
    pub verified_at: Option<OffsetDateTime>,
    pub unsubscribed_at: Option<OffsetDateTime>,
    pub subscribed_at: OffsetDateTime,
    pub ip_address: Option<String>,
    #[sea_orm(column_type = "Text", nullable)]
    pub user_agent: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberState {
    Unverified,
    Verified,
    Unsubscribed,
}

impl Model {
    pub fn state(&self) -> SubscriberState {
        match (self.unsubscribed_at, self.email_verified) {
            (Some(_), _) => SubscriberState::Unsubscribed,
            (None, true) => SubscriberState::Verified,
            (None, false) => SubscriberState::Unverified,
        }
    }

    pub fn metadata(&self) -> RequestMetadata {
        RequestMetadata {
            ip_address: self.ip_address.clone(),
            user_agent: self.user_agent.clone(),
            country: self.country.clone(),
            city: self.city.clone(),
        }
    }
}
