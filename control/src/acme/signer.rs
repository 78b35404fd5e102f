//! Certificate renewal decisions
//!
//! A `Signer` owns at most one ACME client, bound to the `Account` it was
//! connected with. Every certificate group notification runs `verify`, which
//! signs and stores a new certificate when the stored one is missing,
//! expiring inside the configured window, or does not cover every requested
//! domain.

use super::account::Account;
use super::client::AcmeError;
use super::tls::TlsSecret;
use crate::apis::metrics;
use crate::error::{BoxError, ControlError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

/// Upper bound of a single sign call, polling included
pub const DEFAULT_SIGN_TIMEOUT: StdDuration = StdDuration::from_secs(300);

/// PEM encoded certificate chain and private key returned by a signer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedCertificate {
    pub crt: Vec<u8>,
    pub key: Vec<u8>,
}

/// A live ACME session able to issue certificates
#[async_trait]
pub trait Sign: Send + Sync {
    async fn sign(&self, domains: &[String]) -> Result<SignedCertificate, AcmeError>;
}

/// Builds a `Sign` client bound to an account
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, account: &Account) -> Result<Box<dyn Sign>, AcmeError>;
}

/// Read and write access to stored TLS certificates
#[async_trait]
pub trait TlsSecretStore: Send + Sync {
    /// Parsed content of `namespace/name`, `None` when absent or unreadable
    fn get_tls_secret_content(&self, secret_name: &str) -> Option<TlsSecret>;

    async fn set_tls_secret_content(
        &self,
        secret_name: &str,
        crt: &[u8],
        key: &[u8],
    ) -> Result<(), BoxError>;
}

/// Certificate group: the secret holding the certificate and its domains
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CertRequest {
    pub secret_name: String,
    pub domains: Vec<String>,
}

impl CertRequest {
    pub fn new(secret_name: impl Into<String>, domains: Vec<String>) -> Self {
        Self {
            secret_name: secret_name.into(),
            domains,
        }
    }

    /// Parse the `secret,domain1,domain2` encoding
    ///
    /// Empty domain entries are dropped, so `"secret,"` has no domains.
    pub fn parse(item: &str) -> Self {
        let mut parts = item.split(',').map(str::trim);
        let secret_name = parts.next().unwrap_or_default().to_string();
        let domains = parts
            .filter(|domain| !domain.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            secret_name,
            domains,
        }
    }
}

impl fmt::Display for CertRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.secret_name)?;
        for domain in &self.domains {
            write!(f, ",{}", domain)?;
        }
        Ok(())
    }
}

/// Outcome of a successful `verify`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertStatus {
    Issued,
    UpToDate,
}

/// Why a certificate is being (re)issued
enum Renewal {
    Missing,
    Expiring(DateTime<Utc>),
    NewDomains,
}

impl fmt::Display for Renewal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Renewal::Missing => f.write_str("certificate does not exist"),
            Renewal::Expiring(not_after) => write!(f, "certificate expires in {}", not_after),
            Renewal::NewDomains => {
                f.write_str("added one or more domains to an existing certificate")
            }
        }
    }
}

pub struct Signer {
    store: Arc<dyn TlsSecretStore>,
    connector: Arc<dyn Connector>,
    account: Account,
    client: Option<Box<dyn Sign>>,
    expiring: Duration,
    sign_timeout: StdDuration,
    verify_count: u64,
}

impl Signer {
    pub fn new(store: Arc<dyn TlsSecretStore>, connector: Arc<dyn Connector>) -> Self {
        Self {
            store,
            connector,
            account: Account::default(),
            client: None,
            expiring: Duration::zero(),
            sign_timeout: DEFAULT_SIGN_TIMEOUT,
            verify_count: 0,
        }
    }

    pub fn with_sign_timeout(mut self, timeout: StdDuration) -> Self {
        self.sign_timeout = timeout;
        self
    }

    /// Bind the signer to an account
    ///
    /// No-op when the (normalized) tuple did not change. Connection failures
    /// are logged and leave signing disabled; the same tuple is retried on
    /// the next call.
    pub async fn acme_account(&mut self, endpoint: &str, emails: &str, terms_agreed: bool) {
        let account = Account::new(endpoint, emails, terms_agreed);
        if account == self.account {
            return;
        }
        self.client = None;
        if account.is_disabled() {
            info!("acme: account removed, signing disabled");
            self.account = account;
            return;
        }

        info!(%account, "acme: loading account");
        match self.connector.connect(&account).await {
            Ok(client) => {
                self.account = account;
                self.client = Some(client);
            }
            Err(e) => {
                warn!(error = %e, "acme: error creating the acme client");
                self.account = Account::default();
            }
        }
    }

    /// Renewal look-ahead window
    pub fn acme_config(&mut self, expiring: Duration) {
        self.expiring = expiring;
    }

    pub fn has_account(&self) -> bool {
        self.client.is_some()
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Number of sign attempts so far
    pub fn verify_count(&self) -> u64 {
        self.verify_count
    }

    /// Check the certificate group encoded as `secret,domain1,domain2`
    pub async fn notify(&mut self, item: &str) -> Result<CertStatus, ControlError> {
        self.notify_request(&CertRequest::parse(item)).await
    }

    pub async fn notify_request(
        &mut self,
        request: &CertRequest,
    ) -> Result<CertStatus, ControlError> {
        if !self.has_account() {
            return Err(ControlError::AccountUninitialized);
        }
        if request.domains.is_empty() {
            return Err(ControlError::EmptyDomains(request.secret_name.clone()));
        }
        self.verify(&request.secret_name, &request.domains).await
    }

    async fn verify(
        &mut self,
        secret_name: &str,
        domains: &[String],
    ) -> Result<CertStatus, ControlError> {
        let duedate = Utc::now()
            .checked_add_signed(self.expiring)
            .ok_or(ControlError::RenewalWindow(self.expiring.num_days()))?;
        let strdomains = domains.join(",");

        let renewal = match self.store.get_tls_secret_content(secret_name) {
            None => Some(Renewal::Missing),
            Some(tls) if tls.not_after < duedate => Some(Renewal::Expiring(tls.not_after)),
            Some(tls) if !match_domains(domains, &tls.dns_names) => Some(Renewal::NewDomains),
            Some(_) => None,
        };

        let Some(why) = renewal else {
            debug!(
                secret = secret_name,
                domains = %strdomains,
                "acme: skipping sign, certificate is updated"
            );
            return Ok(CertStatus::UpToDate);
        };

        self.verify_count += 1;
        let id = self.verify_count;
        let client = self
            .client
            .as_ref()
            .ok_or(ControlError::AccountUninitialized)?;
        info!(
            id,
            secret = secret_name,
            domains = %strdomains,
            endpoint = %self.account.endpoint,
            why = %why,
            "acme: authorizing"
        );

        let signed = match tokio::time::timeout(self.sign_timeout, client.sign(domains)).await {
            Ok(Ok(signed)) => signed,
            Ok(Err(e)) => {
                warn!(
                    id,
                    secret = secret_name,
                    domains = %strdomains,
                    error = %e,
                    "acme: error signing new certificate"
                );
                metrics::record_certificate_issue("sign_error");
                return Err(ControlError::Signing(e));
            }
            Err(_) => {
                let e = AcmeError::Issuance(format!(
                    "no certificate after {}s",
                    self.sign_timeout.as_secs_f64()
                ));
                warn!(
                    id,
                    secret = secret_name,
                    domains = %strdomains,
                    error = %e,
                    "acme: error signing new certificate"
                );
                metrics::record_certificate_issue("sign_error");
                return Err(ControlError::Signing(e));
            }
        };

        if let Err(e) = self
            .store
            .set_tls_secret_content(secret_name, &signed.crt, &signed.key)
            .await
        {
            warn!(
                id,
                secret = secret_name,
                domains = %strdomains,
                error = %e,
                "acme: error storing new certificate"
            );
            metrics::record_certificate_issue("store_error");
            return Err(ControlError::Storage(e));
        }

        info!(id, secret = secret_name, domains = %strdomains, "acme: new certificate issued");
        metrics::record_certificate_issue("issued");
        Ok(CertStatus::Issued)
    }
}

/// True when every requested domain is covered by the certificate
pub fn match_domains(domains: &[String], dns_names: &[String]) -> bool {
    domains
        .iter()
        .all(|domain| dns_names.iter().any(|dns| dns == domain))
}
