//! Absolute links embedded in outgoing email.

use url::Url;

const VERIFY_PATH: &str = "v1/newsletter/verify";
const UNSUBSCRIBE_PATH: &str = "v1/newsletter/unsubscribe";

/// Builds `<base>/v1/newsletter/{verify,unsubscribe}?token=..&email=..` links.
#[derive(Clone, Debug)]
pub struct LinkBuilder {
    verify_endpoint: Url,
    unsubscribe_endpoint: Url,
}

impl LinkBuilder {
    /// `base` may carry a path prefix (`https://host/api`); a trailing slash is optional.
    pub fn new(base: &str) -> Result<Self, url::ParseError> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        base.set_query(None);
        base.set_fragment(None);

        Ok(Self {
            verify_endpoint: base.join(VERIFY_PATH)?,
            unsubscribe_endpoint: base.join(UNSUBSCRIBE_PATH)?,
        })
    }

    pub fn verification_url(&self, email: &str, token: &str) -> String {
        with_query(&self.verify_endpoint, email, token)
    }

    pub fn unsubscribe_url(&self, email: &str, token: &str) -> String {
        with_query(&self.unsubscribe_endpoint, email, token)
    }
}

fn with_query(endpoint: &Url, email: &str, token: &str) -> String {
    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair("token", token)
        .append_pair("email", email);
    url.into()
}
