use thiserror::Error;

use crate::acme::AcmeError;

/// Boxed error returned by storage collaborators
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Gatehouse control plane errors
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("acme: account was not properly initialized")]
    AccountUninitialized,

    #[error("invalid port number: {0}")]
    InvalidPort(i32),

    /// Lookup collaborator failure, passed through untouched
    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("acme: error signing new certificate: {0}")]
    Signing(#[source] AcmeError),

    #[error("acme: error storing new certificate: {0}")]
    Storage(#[source] BoxError),

    #[error("acme: no domains requested for secret {0}")]
    EmptyDomains(String),

    #[error("acme: renewal window of {0} days is out of range")]
    RenewalWindow(i64),
}

/// Failures of the cache lookup collaborators
#[derive(Error, Debug)]
pub enum LookupError {
    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("failed to resolve external name {name}: {source}")]
    Dns {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl LookupError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        LookupError::NotFound {
            kind,
            name: name.into(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_error_is_transparent() {
        let err: ControlError = LookupError::not_found("Service", "default/web").into();
        assert_eq!(err.to_string(), "Service not found: default/web");
    }

    #[test]
    fn test_storage_error_keeps_source() {
        let err = ControlError::Storage("secret is immutable".into());
        assert!(err.to_string().contains("secret is immutable"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_renewal_window_names_the_days() {
        let err = ControlError::RenewalWindow(1_000_000_000);
        assert_eq!(
            err.to_string(),
            "acme: renewal window of 1000000000 days is out of range"
        );
    }
}
