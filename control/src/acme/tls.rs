//! Parsed TLS secret content

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;
use thiserror::Error;
use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

/// Secret type holding a certificate and its key
pub const TLS_SECRET_TYPE: &str = "kubernetes.io/tls";

pub const TLS_CERT_KEY: &str = "tls.crt";

pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";

#[derive(Error, Debug)]
pub enum TlsSecretError {
    #[error("no certificate found in PEM data")]
    MissingCertificate,

    #[error("no private key found in PEM data")]
    MissingKey,

    #[error("failed to read PEM data: {0}")]
    Pem(#[from] std::io::Error),

    #[error("failed to parse certificate: {0}")]
    Parse(String),
}

/// Certificate and key stored in a TLS secret
///
/// Only the fields the signer looks at are extracted: the expiry and the
/// DNS subject alternative names. The original PEM bytes are kept as is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSecret {
    pub not_after: DateTime<Utc>,
    pub dns_names: Vec<String>,
    pub crt: Vec<u8>,
    pub key: Vec<u8>,
}

impl TlsSecret {
    /// Content with known metadata and no PEM payload
    pub fn new(not_after: DateTime<Utc>, dns_names: Vec<String>) -> Self {
        Self {
            not_after,
            dns_names,
            crt: Vec::new(),
            key: Vec::new(),
        }
    }

    /// Parse the leaf certificate of a PEM chain and check a key is present
    pub fn from_pem(crt: &[u8], key: &[u8]) -> Result<Self, TlsSecretError> {
        let leaf = rustls_pemfile::certs(&mut &crt[..])
            .next()
            .ok_or(TlsSecretError::MissingCertificate)??;

        rustls_pemfile::private_key(&mut &key[..])?.ok_or(TlsSecretError::MissingKey)?;

        let (_, cert) = parse_x509_certificate(leaf.as_ref())
            .map_err(|e| TlsSecretError::Parse(e.to_string()))?;

        let timestamp = cert.validity().not_after.timestamp();
        let not_after = DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| TlsSecretError::Parse(format!("invalid notAfter: {}", timestamp)))?;

        let dns_names = match cert
            .subject_alternative_name()
            .map_err(|e| TlsSecretError::Parse(e.to_string()))?
        {
            Some(san) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            None => Vec::new(),
        };

        Ok(Self {
            not_after,
            dns_names,
            crt: crt.to_vec(),
            key: key.to_vec(),
        })
    }

    /// Parse the `tls.crt` and `tls.key` entries of a Secret
    pub fn from_secret(secret: &Secret) -> Result<Self, TlsSecretError> {
        let data = secret.data.as_ref();
        let crt = data
            .and_then(|d| d.get(TLS_CERT_KEY))
            .ok_or(TlsSecretError::MissingCertificate)?;
        let key = data
            .and_then(|d| d.get(TLS_PRIVATE_KEY_KEY))
            .ok_or(TlsSecretError::MissingKey)?;
        Self::from_pem(&crt.0, &key.0)
    }
}

/// `kubernetes.io/tls` Secret holding a certificate chain and key
pub fn tls_secret_object(namespace: &str, name: &str, crt: &[u8], key: &[u8]) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(TLS_CERT_KEY.to_string(), ByteString(crt.to_vec()));
    data.insert(TLS_PRIVATE_KEY_KEY.to_string(), ByteString(key.to_vec()));
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        type_: Some(TLS_SECRET_TYPE.to_string()),
        data: Some(data),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn self_signed(domains: &[&str], days: i64) -> (String, String) {
        let mut params = CertificateParams::new(
            domains.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
        )
        .expect("Should build certificate params");
        params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
        params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(days);
        let key = KeyPair::generate().expect("Should generate key");
        let cert = params.self_signed(&key).expect("Should self-sign");
        (cert.pem(), key.serialize_pem())
    }

    #[test]
    fn test_from_pem_extracts_names_and_expiry() {
        let (crt, key) = self_signed(&["example.com", "www.example.com"], 30);
        let tls = TlsSecret::from_pem(crt.as_bytes(), key.as_bytes())
            .expect("Should parse self-signed certificate");

        assert_eq!(tls.dns_names, vec!["example.com", "www.example.com"]);
        let remaining = tls.not_after - Utc::now();
        assert!(remaining > chrono::Duration::days(29));
        assert!(remaining <= chrono::Duration::days(30));
    }

    #[test]
    fn test_secret_object_round_trip() {
        let (crt, key) = self_signed(&["example.com"], 30);
        let secret = tls_secret_object("default", "site-tls", crt.as_bytes(), key.as_bytes());
        assert_eq!(secret.type_.as_deref(), Some(TLS_SECRET_TYPE));

        let tls = TlsSecret::from_secret(&secret).expect("Should parse secret");
        assert_eq!(tls.dns_names, vec!["example.com"]);
        assert!(matches!(
            TlsSecret::from_secret(&Secret::default()),
            Err(TlsSecretError::MissingCertificate)
        ));
    }

    #[test]
    fn test_from_pem_rejects_missing_parts() {
        let (crt, key) = self_signed(&["example.com"], 30);

        assert!(matches!(
            TlsSecret::from_pem(b"", key.as_bytes()),
            Err(TlsSecretError::MissingCertificate)
        ));
        assert!(matches!(
            TlsSecret::from_pem(crt.as_bytes(), b""),
            Err(TlsSecretError::MissingKey)
        ));
    }
}
