//! Certificate automation
//!
//! `Signer` decides when a certificate group needs a new certificate,
//! `AcmeConnector`/`AcmeClient` talk to the certificate authority, and the
//! `ChallengeStore` holds pending HTTP-01 responses.

pub mod account;
pub mod challenge;
pub mod client;
pub mod signer;
pub mod tls;

pub use account::{normalize_endpoint, Account, LETSENCRYPT_PRODUCTION, LETSENCRYPT_STAGING};
pub use challenge::{ChallengeStore, CHALLENGE_PATH_PREFIX};
pub use client::{AcmeClient, AcmeConnector, AcmeError};
pub use signer::{
    match_domains, CertRequest, CertStatus, Connector, Sign, SignedCertificate, Signer,
    TlsSecretStore,
};
pub use tls::{tls_secret_object, TlsSecret, TlsSecretError, TLS_SECRET_TYPE};
