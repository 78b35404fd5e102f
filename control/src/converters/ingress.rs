//! Ingress converter
//!
//! Translates an Ingress into its `Contribution`: hostnames and paths,
//! referenced backends, TLS and user list secrets and, for
//! `kubernetes.io/tls-acme` ingresses, the certificate groups to keep signed.

use super::annotations::AUTH_SECRET_ANNOTATION;
use super::changes::tracking_name_of;
use super::types::{full_name, DEFAULT_NAMESPACE};
use super::model::{validate_hostname, validate_path, BackendRef, Contribution, DEFAULT_HOST};
use crate::acme::CertRequest;
use gatehouse_common::{ResourceType, TrackingRef};
use k8s_openapi::api::networking::v1::{Ingress, IngressBackend};
use kube::ResourceExt;
use tracing::{debug, warn};

/// Legacy annotation naming the ingress class
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Ingresses with this annotation set to "true" get ACME certificates
pub const TLS_ACME_ANNOTATION: &str = "kubernetes.io/tls-acme";

/// Decides which Ingress objects belong to this controller
#[derive(Debug, Clone)]
pub struct IngressClassFilter {
    pub ingress_class: String,
    pub watch_ingress_without_class: bool,
}

impl IngressClassFilter {
    pub fn new(ingress_class: impl Into<String>, watch_ingress_without_class: bool) -> Self {
        Self {
            ingress_class: ingress_class.into(),
            watch_ingress_without_class,
        }
    }

    /// `spec.ingressClassName` wins over the legacy annotation
    pub fn accepts(&self, ingress: &Ingress) -> bool {
        let class_name = ingress
            .spec
            .as_ref()
            .and_then(|spec| spec.ingress_class_name.as_deref())
            .or_else(|| {
                ingress
                    .annotations()
                    .get(INGRESS_CLASS_ANNOTATION)
                    .map(String::as_str)
            });
        match class_name {
            Some(name) => name == self.ingress_class,
            None => self.watch_ingress_without_class,
        }
    }
}

fn backend_ref(namespace: &str, backend: &IngressBackend) -> Option<BackendRef> {
    let service = backend.service.as_ref()?;
    let port = service.port.as_ref()?;
    let port = match (&port.name, port.number) {
        (Some(name), _) if !name.is_empty() => name.clone(),
        (_, Some(number)) => number.to_string(),
        _ => return None,
    };
    Some(BackendRef::new(namespace, service.name.as_str(), port))
}

/// Convert one Ingress
///
/// Invalid hostnames and paths are skipped with a warning, the rest of the
/// object is still converted.
pub fn convert_ingress(ingress: &Ingress) -> Contribution {
    let name = tracking_name_of(ingress);
    let namespace = ingress
        .namespace()
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let mut contribution =
        Contribution::new(TrackingRef::new(ResourceType::Ingress, name.as_str()));

    let Some(spec) = ingress.spec.as_ref() else {
        return contribution;
    };

    if let Some(default_backend) = &spec.default_backend {
        match backend_ref(&namespace, default_backend) {
            Some(backend) => contribution.add_path(DEFAULT_HOST, "/", backend),
            None => warn!(ingress = %name, "default backend has no service port, ignoring"),
        }
    }

    for rule in spec.rules.iter().flatten() {
        let host = match rule.host.as_deref() {
            Some(host) if !host.is_empty() => host,
            _ => DEFAULT_HOST,
        };
        if host != DEFAULT_HOST {
            if let Err(e) = validate_hostname(host) {
                warn!(ingress = %name, "skipping rule: {}", e);
                continue;
            }
        }
        let Some(http) = rule.http.as_ref() else {
            continue;
        };
        for path in &http.paths {
            let path_value = path.path.as_deref().unwrap_or("/");
            if let Err(e) = validate_path(path_value) {
                warn!(ingress = %name, host, "skipping path: {}", e);
                continue;
            }
            match backend_ref(&namespace, &path.backend) {
                Some(backend) => contribution.add_path(host, path_value, backend),
                None => warn!(
                    ingress = %name,
                    host,
                    path = path_value,
                    "path has no service backend, ignoring"
                ),
            }
        }
    }

    if let Some(secret) = ingress
        .annotations()
        .get(AUTH_SECRET_ANNOTATION)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
    {
        let userlist = full_name(secret, &namespace);
        contribution.secrets.insert(userlist.clone());
        contribution.userlists.insert(userlist);
    }

    let acme = ingress
        .annotations()
        .get(TLS_ACME_ANNOTATION)
        .is_some_and(|value| value == "true");

    for tls in spec.tls.iter().flatten() {
        let Some(secret_name) = tls.secret_name.as_deref().filter(|s| !s.is_empty()) else {
            continue;
        };
        let secret = format!("{}/{}", namespace, secret_name);
        contribution.secrets.insert(secret.clone());

        if acme {
            let domains: Vec<String> = tls
                .hosts
                .iter()
                .flatten()
                .filter(|host| !host.is_empty())
                .cloned()
                .collect();
            if domains.is_empty() {
                warn!(ingress = %name, secret = %secret, "tls-acme entry without hosts, ignoring");
                continue;
            }
            contribution.certs.push(CertRequest::new(secret, domains));
        }
    }

    debug!(
        ingress = %name,
        hostnames = contribution.hostnames.len(),
        backends = contribution.backends.len(),
        certs = contribution.certs.len(),
        "converted ingress"
    );
    contribution
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::converters::tracker::Tracker;
    use gatehouse_common::TrackingLinks;
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressRule, IngressServiceBackend, IngressSpec,
        IngressTLS, ServiceBackendPort,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn service_backend(name: &str, number: i32) -> IngressBackend {
        IngressBackend {
            service: Some(IngressServiceBackend {
                name: name.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(number),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        }
    }

    fn ingress(annotations: &[(&str, &str)], spec: IngressSpec) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("site".to_string()),
                namespace: Some("web".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn rule(host: &str, paths: &[(&str, &str, i32)]) -> IngressRule {
        IngressRule {
            host: Some(host.to_string()),
            http: Some(HTTPIngressRuleValue {
                paths: paths
                    .iter()
                    .map(|(path, svc, port)| HTTPIngressPath {
                        path: Some(path.to_string()),
                        path_type: "Prefix".to_string(),
                        backend: service_backend(svc, *port),
                    })
                    .collect(),
            }),
        }
    }

    #[test]
    fn test_class_filter() {
        let filter = IngressClassFilter::new("gatehouse", false);

        let by_spec = ingress(
            &[],
            IngressSpec {
                ingress_class_name: Some("gatehouse".to_string()),
                ..Default::default()
            },
        );
        let by_annotation =
            ingress(&[(INGRESS_CLASS_ANNOTATION, "gatehouse")], IngressSpec::default());
        let other = ingress(&[(INGRESS_CLASS_ANNOTATION, "nginx")], IngressSpec::default());
        let unclassified = ingress(&[], IngressSpec::default());

        assert!(filter.accepts(&by_spec));
        assert!(filter.accepts(&by_annotation));
        assert!(!filter.accepts(&other));
        assert!(!filter.accepts(&unclassified));
        assert!(IngressClassFilter::new("gatehouse", true).accepts(&unclassified));
    }

    #[test]
    fn test_convert_rules_and_default_backend() {
        let ing = ingress(
            &[],
            IngressSpec {
                default_backend: Some(service_backend("fallback", 8080)),
                rules: Some(vec![
                    rule("example.com", &[("/", "web", 80), ("/api", "api", 9000)]),
                    rule("Bad_Host", &[("/", "web", 80)]),
                ]),
                ..Default::default()
            },
        );

        let contribution = convert_ingress(&ing);

        assert_eq!(
            contribution.source,
            TrackingRef::new(ResourceType::Ingress, "web/site")
        );
        assert_eq!(contribution.hostnames.len(), 2);
        assert_eq!(contribution.hostnames["example.com"].len(), 2);
        assert_eq!(contribution.hostnames[DEFAULT_HOST][0].backend, "web_fallback_8080");
        let ids: Vec<String> = contribution.backends.iter().map(BackendRef::id).collect();
        assert_eq!(ids, vec!["web_api_9000", "web_fallback_8080", "web_web_80"]);
    }

    #[test]
    fn test_tls_acme_builds_cert_groups() {
        let spec = IngressSpec {
            rules: Some(vec![rule("example.com", &[("/", "web", 80)])]),
            tls: Some(vec![IngressTLS {
                hosts: Some(vec!["example.com".to_string(), "www.example.com".to_string()]),
                secret_name: Some("site-tls".to_string()),
            }]),
            ..Default::default()
        };

        let plain = convert_ingress(&ingress(&[], spec.clone()));
        assert!(plain.certs.is_empty());
        assert!(plain.secrets.contains("web/site-tls"));

        let acme = convert_ingress(&ingress(&[(TLS_ACME_ANNOTATION, "true")], spec));
        assert_eq!(acme.certs.len(), 1);
        assert_eq!(acme.certs[0].secret_name, "web/site-tls");
        assert_eq!(acme.certs[0].domains, vec!["example.com", "www.example.com"]);
    }

    #[test]
    fn test_auth_secret_becomes_userlist() {
        let spec = IngressSpec {
            rules: Some(vec![rule("example.com", &[("/", "web", 80)])]),
            ..Default::default()
        };

        let local = convert_ingress(&ingress(&[(AUTH_SECRET_ANNOTATION, "users")], spec.clone()));
        assert_eq!(local.userlists.iter().collect::<Vec<_>>(), vec!["web/users"]);
        assert!(local.secrets.contains("web/users"));

        let shared = convert_ingress(&ingress(&[(AUTH_SECRET_ANNOTATION, "auth/users")], spec));
        assert_eq!(shared.userlists.iter().collect::<Vec<_>>(), vec!["auth/users"]);

        let tracker = Tracker::new();
        shared.track(&tracker);
        let secret: TrackingLinks = [(ResourceType::Secret, "auth/users".to_string())]
            .into_iter()
            .collect();
        let sources = tracker.query_links(&secret, false);
        assert!(sources.contains(ResourceType::Ingress, "web/site"));
        let outputs = tracker.query_links(&sources, false);
        assert!(outputs.contains(ResourceType::Userlist, "auth/users"));
    }

    #[test]
    fn test_named_port_and_missing_service() {
        let mut named = service_backend("web", 0);
        if let Some(service) = named.service.as_mut() {
            service.port = Some(ServiceBackendPort {
                name: Some("http".to_string()),
                number: None,
            });
        }
        assert_eq!(
            backend_ref("web", &named).map(|b| b.id()),
            Some("web_web_http".to_string())
        );
        assert_eq!(backend_ref("web", &IngressBackend::default()), None);
    }
}
