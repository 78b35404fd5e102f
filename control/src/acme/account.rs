use std::fmt;

/// Let's Encrypt production directory host
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org";

/// Let's Encrypt staging directory host
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org";

/// ACME account parameters
///
/// Two accounts are the same account when every field matches; the signer
/// only reconnects when this tuple changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub endpoint: String,
    /// Comma separated contact emails
    pub emails: String,
    pub terms_agreed: bool,
}

impl Account {
    /// Build an account, expanding the well-known endpoint aliases
    pub fn new(endpoint: &str, emails: &str, terms_agreed: bool) -> Self {
        Self {
            endpoint: normalize_endpoint(endpoint).to_string(),
            emails: emails.to_string(),
            terms_agreed,
        }
    }

    /// True for the all-empty tuple, which leaves signing disabled
    pub fn is_disabled(&self) -> bool {
        self.endpoint.is_empty() && self.emails.is_empty() && !self.terms_agreed
    }

    /// Contact list in `mailto:` form
    pub fn contacts(&self) -> Vec<String> {
        self.emails
            .split(',')
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .map(|email| format!("mailto:{}", email))
            .collect()
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "endpoint={} emails={} terms_agreed={}",
            self.endpoint, self.emails, self.terms_agreed
        )
    }
}

/// Expand `v2`/`v02` and their `-staging` variants to the Let's Encrypt URLs
pub fn normalize_endpoint(endpoint: &str) -> &str {
    match endpoint {
        "v2" | "v02" => LETSENCRYPT_PRODUCTION,
        "v2-staging" | "v02-staging" => LETSENCRYPT_STAGING,
        other => other,
    }
}
