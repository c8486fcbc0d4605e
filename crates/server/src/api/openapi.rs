//! OpenAPI/Utoipa configuration.

use crate::api::{health::MISC_TAG, newsletter::NEWSLETTER_TAG};
use utoipa::OpenApi;

/// OpenAPI documentation configuration.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Newsletter API",
        version = "1.0.0",
        description = "Double opt-in newsletter subscriptions."
    ),
    tags(
        (name = MISC_TAG, description = "Miscellaneous endpoints"),
        (name = NEWSLETTER_TAG, description = "Subscribe, verify and unsubscribe")
    )
)]
pub struct ApiDoc;
