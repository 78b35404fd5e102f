//! ACME client implementation using instant-acme
//!
//! Orders are validated with HTTP-01: key authorizations are published in the
//! shared `ChallengeStore` for the control server to answer, and removed once
//! the order settles.

use super::account::Account;
use super::challenge::ChallengeStore;
use super::signer::{Connector, Sign, SignedCertificate};
use async_trait::async_trait;
use instant_acme::{
    Account as AcmeAccount, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder,
    Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Interval between order status checks
const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Attempts before giving up on an order (about two minutes)
const ORDER_POLL_MAX_ATTEMPTS: u32 = 60;

/// Interval for polling certificate availability after finalization
const CERT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts before giving up on a finalized order's certificate
const CERT_POLL_MAX_ATTEMPTS: u32 = 60;

/// Errors from the certificate authority conversation
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME account error: {0}")]
    Account(String),

    #[error("order failed: {0}")]
    Order(String),

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error("certificate issuance failed: {0}")]
    Issuance(String),

    #[error("certificate generation error: {0}")]
    CertGeneration(String),
}

/// Full directory URL of an ACME endpoint
///
/// Endpoints are configured by host (`https://acme-v02.api.letsencrypt.org`);
/// the directory path is appended when missing.
pub fn directory_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.ends_with("/directory") {
        endpoint.to_string()
    } else {
        format!("{}/directory", endpoint)
    }
}

/// Connects accounts against a real ACME directory
pub struct AcmeConnector {
    challenges: Arc<ChallengeStore>,
}

impl AcmeConnector {
    pub fn new(challenges: Arc<ChallengeStore>) -> Self {
        Self { challenges }
    }
}

#[async_trait]
impl Connector for AcmeConnector {
    async fn connect(&self, account: &Account) -> Result<Box<dyn Sign>, AcmeError> {
        let url = directory_url(&account.endpoint);
        let contacts = account.contacts();
        let contact_refs: Vec<&str> = contacts.iter().map(String::as_str).collect();

        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: account.terms_agreed,
            only_return_existing: false,
        };

        let (acme_account, _credentials) = AcmeAccount::create(&new_account, &url, None)
            .await
            .map_err(|e| AcmeError::Account(format!("failed to create account: {}", e)))?;

        info!(directory = %url, "acme: account registered");

        Ok(Box::new(AcmeClient {
            account: acme_account,
            challenges: self.challenges.clone(),
        }))
    }
}

/// Live ACME session bound to one registered account
pub struct AcmeClient {
    account: AcmeAccount,
    challenges: Arc<ChallengeStore>,
}

#[async_trait]
impl Sign for AcmeClient {
    async fn sign(&self, domains: &[String]) -> Result<SignedCertificate, AcmeError> {
        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|domain| Identifier::Dns(domain.clone()))
            .collect();

        let mut order = self
            .account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| AcmeError::Order(format!("failed to create order: {}", e)))?;

        let mut tokens = Vec::new();
        let result = self.authorize_and_finalize(&mut order, domains, &mut tokens).await;

        for token in &tokens {
            self.challenges.remove_challenge(token).await;
        }

        result
    }
}

impl AcmeClient {
    async fn authorize_and_finalize(
        &self,
        order: &mut Order,
        domains: &[String],
        tokens: &mut Vec<String>,
    ) -> Result<SignedCertificate, AcmeError> {
        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| AcmeError::Authorization(format!("failed to get authorizations: {}", e)))?;

        for auth in &authorizations {
            match &auth.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(AcmeError::Authorization(format!(
                        "unexpected authorization status {:?} for {:?}",
                        status, auth.identifier
                    )))
                }
            }

            let challenge = auth
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    AcmeError::Authorization(format!(
                        "no HTTP-01 challenge available for {:?}",
                        auth.identifier
                    ))
                })?;

            let key_auth = order.key_authorization(challenge);
            self.challenges
                .add_challenge(&challenge.token, key_auth.as_str())
                .await;
            tokens.push(challenge.token.clone());

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| {
                    AcmeError::Authorization(format!("failed to set challenge ready: {}", e))
                })?;
        }

        wait_for_order_ready(order).await?;

        let (csr, key_pair) = generate_csr(domains)?;
        order
            .finalize(&csr)
            .await
            .map_err(|e| AcmeError::Issuance(format!("failed to finalize order: {}", e)))?;

        let chain = wait_for_certificate(order).await?;

        Ok(SignedCertificate {
            crt: chain.into_bytes(),
            key: key_pair.serialize_pem().into_bytes(),
        })
    }
}

async fn wait_for_order_ready(order: &mut Order) -> Result<(), AcmeError> {
    for attempt in 1..=ORDER_POLL_MAX_ATTEMPTS {
        tokio::time::sleep(ORDER_POLL_INTERVAL).await;

        let state = order
            .refresh()
            .await
            .map_err(|e| AcmeError::Order(format!("failed to refresh order: {}", e)))?;

        match state.status {
            OrderStatus::Ready | OrderStatus::Valid => {
                debug!(attempts = attempt, "Order ready");
                return Ok(());
            }
            OrderStatus::Invalid => {
                return Err(AcmeError::Authorization("order became invalid".to_string()));
            }
            OrderStatus::Pending | OrderStatus::Processing => {
                debug!(attempt, status = ?state.status, "Waiting for authorization");
            }
        }
    }

    Err(AcmeError::Order(format!(
        "order not ready after {} attempts",
        ORDER_POLL_MAX_ATTEMPTS
    )))
}

async fn wait_for_certificate(order: &mut Order) -> Result<String, AcmeError> {
    for attempt in 1..=CERT_POLL_MAX_ATTEMPTS {
        match order.certificate().await {
            Ok(Some(chain)) => return Ok(chain),
            Ok(None) => {
                debug!(attempt, "Certificate not ready yet, waiting");
                tokio::time::sleep(CERT_POLL_INTERVAL).await;
            }
            Err(e) => {
                return Err(AcmeError::Issuance(format!(
                    "failed to get certificate: {}",
                    e
                )))
            }
        }
    }

    Err(AcmeError::Issuance(format!(
        "certificate not available after {} attempts",
        CERT_POLL_MAX_ATTEMPTS
    )))
}

/// CSR for the requested domains, first domain as common name
pub fn generate_csr(domains: &[String]) -> Result<(Vec<u8>, KeyPair), AcmeError> {
    let key_pair = KeyPair::generate()
        .map_err(|e| AcmeError::CertGeneration(format!("failed to generate key pair: {}", e)))?;

    let mut params = CertificateParams::default();
    if let Some(first) = domains.first() {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, first.clone());
        params.distinguished_name = dn;
    }
    params.subject_alt_names = domains
        .iter()
        .filter_map(|d| d.clone().try_into().ok().map(SanType::DnsName))
        .collect();

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| AcmeError::CertGeneration(format!("failed to create CSR: {}", e)))?;

    Ok((csr.der().to_vec(), key_pair))
}
