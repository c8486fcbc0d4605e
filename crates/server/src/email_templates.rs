//! Verification email rendering (Askama HTML + plain text).
use askama::Template;

pub const VERIFICATION_SUBJECT: &str = "Confirm your newsletter subscription";

#[derive(Template)]
#[template(path = "verification_email.html")]
pub struct VerificationEmailTemplate {
    pub verify_url: String,
    pub unsubscribe_url: String,
}

impl VerificationEmailTemplate {
    #[tracing::instrument(skip(self))]
    pub fn render_html(&self) -> Result<String, askama::Error> {
        self.render()
    }

    #[tracing::instrument(skip(self))]
    pub fn render_text(&self) -> String {
        format!(
            r#"Hello,

Thanks for signing up for our newsletter. Please confirm your subscription by opening this link:

{}

If you did not request this, you can ignore this email and you will not hear from us again.

---
Unsubscribe: {}"#,
            self.verify_url, self.unsubscribe_url
        )
    }
}
