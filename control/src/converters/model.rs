//! Resolved routing model
//!
//! Every routing source (an Ingress, an HTTPRoute, the TCP services
//! ConfigMap) converts into one `Contribution`. The reconciler keeps one
//! contribution per source and replaces it whole when the source changes.

use super::tracker::Tracker;
use crate::acme::CertRequest;
use gatehouse_common::{ResourceType, TrackingRef};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Hostname used for rules and default backends without a host
pub const DEFAULT_HOST: &str = "<default>";

/// A service port referenced by a routing source
///
/// `port` is either the numeric service port or the port name, exactly as
/// the source wrote it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BackendRef {
    pub namespace: String,
    pub service: String,
    pub port: String,
}

impl BackendRef {
    pub fn new(
        namespace: impl Into<String>,
        service: impl Into<String>,
        port: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            service: service.into(),
            port: port.into(),
        }
    }

    /// Backend identity used by the tracker and the model: `ns_svc_port`
    pub fn id(&self) -> String {
        format!("{}_{}_{}", self.namespace, self.service, self.port)
    }

    /// `namespace/service`, the tracking name of the Service and Endpoints
    pub fn service_name(&self) -> String {
        format!("{}/{}", self.namespace, self.service)
    }
}

impl fmt::Display for BackendRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.service, self.port)
    }
}

/// One path of a hostname, pointing to a backend id
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PathRoute {
    pub path: String,
    pub backend: String,
}

/// A listening port of the TCP services ConfigMap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpService {
    pub port: i32,
    pub backend: BackendRef,
}

/// Everything a single routing source adds to the model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contribution {
    pub source: TrackingRef,
    pub hostnames: BTreeMap<String, Vec<PathRoute>>,
    pub backends: BTreeSet<BackendRef>,
    /// Certificate groups requested through `kubernetes.io/tls-acme`
    pub certs: Vec<CertRequest>,
    /// TLS secrets referenced by the source, as `namespace/name`
    pub secrets: BTreeSet<String>,
    /// Basic authentication user lists, as `namespace/secret`
    pub userlists: BTreeSet<String>,
    pub tcp_services: Vec<TcpService>,
}

impl Contribution {
    pub fn new(source: TrackingRef) -> Self {
        Self {
            source,
            hostnames: BTreeMap::new(),
            backends: BTreeSet::new(),
            certs: Vec::new(),
            secrets: BTreeSet::new(),
            userlists: BTreeSet::new(),
            tcp_services: Vec::new(),
        }
    }

    pub fn add_path(&mut self, host: &str, path: &str, backend: BackendRef) {
        let routes = self.hostnames.entry(host.to_string()).or_default();
        let route = PathRoute {
            path: path.to_string(),
            backend: backend.id(),
        };
        if !routes.contains(&route) {
            routes.push(route);
            routes.sort();
        }
        self.backends.insert(backend);
    }

    /// Record the links that make this contribution stale when an input changes
    ///
    /// The source is the left side of every computed object it produced, and
    /// each referenced secret is the left side of the source.
    pub fn track(&self, tracker: &Tracker) {
        for backend in &self.backends {
            tracker.track_refs(
                self.source.clone(),
                TrackingRef::new(ResourceType::Backend, backend.id()),
            );
        }
        for host in self.hostnames.keys() {
            tracker.track_refs(
                self.source.clone(),
                TrackingRef::new(ResourceType::Hostname, host.as_str()),
            );
        }
        for cert in &self.certs {
            tracker.track_refs(
                self.source.clone(),
                TrackingRef::new(ResourceType::AcmeData, cert.secret_name.as_str()),
            );
        }
        for userlist in &self.userlists {
            tracker.track_refs(
                self.source.clone(),
                TrackingRef::new(ResourceType::Userlist, userlist.as_str()),
            );
        }
        for tcp in &self.tcp_services {
            tracker.track_refs(
                self.source.clone(),
                TrackingRef::new(ResourceType::TcpService, tcp.port.to_string()),
            );
        }
        for secret in &self.secrets {
            tracker.track_refs(
                TrackingRef::new(ResourceType::Secret, secret.as_str()),
                self.source.clone(),
            );
        }
    }
}

/// Check a request path: absolute, without empty segments
pub fn validate_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("Path cannot be empty".to_string());
    }

    if !path.starts_with('/') {
        return Err(format!("Path '{}' must start with '/'", path));
    }

    if path.contains("//") {
        return Err(format!("Path '{}' cannot contain double slashes", path));
    }

    Ok(())
}

/// Validate hostname according to DNS-1123 subdomain rules
///
/// Lowercase alphanumerics, hyphens and dots, an optional `*.` prefix, at
/// most 253 characters.
pub fn validate_hostname(hostname: &str) -> Result<(), String> {
    if hostname.is_empty() {
        return Err("Hostname cannot be empty".to_string());
    }

    if hostname.len() > 253 {
        return Err(format!("Hostname '{}' exceeds 253 characters", hostname));
    }

    let hostname_to_check = hostname.strip_prefix("*.").unwrap_or(hostname);
    if hostname_to_check.is_empty() {
        return Err("Hostname cannot be just '*.'".to_string());
    }

    if hostname_to_check.contains("..") {
        return Err(format!("Hostname '{}' cannot contain '..'", hostname));
    }

    for label in hostname_to_check.split('.') {
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!(
                "Hostname label '{}' cannot start or end with '-'",
                label
            ));
        }
        if let Some(c) = label
            .chars()
            .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-')
        {
            return Err(format!(
                "Hostname '{}' contains invalid character '{}'",
                hostname, c
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_identity() {
        let backend = BackendRef::new("default", "web", "http");
        assert_eq!(backend.id(), "default_web_http");
        assert_eq!(backend.service_name(), "default/web");
        assert_eq!(backend.to_string(), "default/web:http");
    }

    #[test]
    fn test_add_path_deduplicates_and_sorts() {
        let mut contribution =
            Contribution::new(TrackingRef::new(ResourceType::Ingress, "default/site"));
        let web = BackendRef::new("default", "web", "80");
        let api = BackendRef::new("default", "api", "8080");

        contribution.add_path("example.com", "/web", web.clone());
        contribution.add_path("example.com", "/api", api);
        contribution.add_path("example.com", "/web", web);

        let routes = &contribution.hostnames["example.com"];
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].path, "/api");
        assert_eq!(routes[1].backend, "default_web_80");
        assert_eq!(contribution.backends.len(), 2);
    }

    #[test]
    fn test_track_records_links_in_both_directions() {
        let tracker = Tracker::new();
        let source = TrackingRef::new(ResourceType::Ingress, "default/site");
        let mut contribution = Contribution::new(source);
        contribution.add_path("example.com", "/", BackendRef::new("default", "web", "80"));
        contribution.secrets.insert("default/site-tls".to_string());
        contribution.certs.push(CertRequest::new(
            "default/site-tls",
            vec!["example.com".to_string()],
        ));

        contribution.track(&tracker);

        let mut input = gatehouse_common::TrackingLinks::new();
        input.insert(ResourceType::Ingress, "default/site");
        let out = tracker.query_links(&input, false);
        assert_eq!(out.get(ResourceType::Backend), ["default_web_80"]);
        assert_eq!(out.get(ResourceType::Hostname), ["example.com"]);
        assert_eq!(out.get(ResourceType::AcmeData), ["default/site-tls"]);

        let mut input = gatehouse_common::TrackingLinks::new();
        input.insert(ResourceType::Secret, "default/site-tls");
        let out = tracker.query_links(&input, false);
        assert_eq!(out.get(ResourceType::Ingress), ["default/site"]);
    }

    #[test]
    fn test_validate_hostname_valid() {
        assert!(validate_hostname("example.com").is_ok());
        assert!(validate_hostname("*.example.com").is_ok());
        assert!(validate_hostname("my-app-123.example.com").is_ok());
    }

    #[test]
    fn test_validate_hostname_invalid() {
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("EXAMPLE.COM").is_err());
        assert!(validate_hostname("example..com").is_err());
        assert!(validate_hostname("-example.com").is_err());
        assert!(validate_hostname("example_test.com").is_err());
        assert!(validate_hostname("*.").is_err());
    }

    #[test]
    fn test_validate_path() {
        assert!(validate_path("/").is_ok());
        assert!(validate_path("/api/").is_ok());
        assert!(validate_path("api").is_err());
        assert!(validate_path("/api//v1").is_err());
    }
}
