//! HTTPRoute converter
//!
//! Gateway API objects are converted on full synchronization only: any
//! Gateway, GatewayClass or HTTPRoute change triggers one.

use super::changes::tracking_name_of;
use super::model::{validate_hostname, validate_path, BackendRef, Contribution, DEFAULT_HOST};
use super::types::DEFAULT_NAMESPACE;
use gateway_api::apis::standard::httproutes::{HTTPRoute, HTTPRouteParentRefs};
use gatehouse_common::{ResourceType, TrackingRef};
use kube::ResourceExt;
use tracing::{debug, warn};

/// Port used when a backendRef does not name one
const DEFAULT_BACKEND_PORT: i32 = 80;

/// True when `gateway_name` is `None` or one of the parent refs names it
pub fn route_attached(
    parent_refs: Option<&Vec<HTTPRouteParentRefs>>,
    gateway_name: Option<&str>,
) -> bool {
    match gateway_name {
        None => true,
        Some(gateway) => parent_refs
            .map(|refs| refs.iter().any(|r| r.name == gateway))
            .unwrap_or(false),
    }
}

/// Convert one HTTPRoute
///
/// Every hostname of the route receives every path of every rule. Only
/// Service backends are supported; other kinds are skipped.
pub fn convert_http_route(route: &HTTPRoute) -> Contribution {
    let name = tracking_name_of(route);
    let namespace = route
        .namespace()
        .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
    let mut contribution =
        Contribution::new(TrackingRef::new(ResourceType::HttpRoute, name.as_str()));

    let mut hostnames: Vec<&str> = Vec::new();
    for host in route.spec.hostnames.iter().flatten() {
        match validate_hostname(host) {
            Ok(()) => hostnames.push(host),
            Err(e) => warn!(route = %name, "skipping hostname: {}", e),
        }
    }
    if hostnames.is_empty() {
        if route.spec.hostnames.as_ref().is_some_and(|h| !h.is_empty()) {
            warn!(route = %name, "no valid hostname, ignoring route");
            return contribution;
        }
        hostnames.push(DEFAULT_HOST);
    }

    for (rule_idx, rule) in route.spec.rules.iter().flatten().enumerate() {
        let mut paths: Vec<&str> = rule
            .matches
            .iter()
            .flatten()
            .map(|m| {
                m.path
                    .as_ref()
                    .and_then(|p| p.value.as_deref())
                    .unwrap_or("/")
            })
            .collect();
        if paths.is_empty() {
            paths.push("/");
        }

        for backend in rule.backend_refs.iter().flatten() {
            if backend.kind.as_deref().is_some_and(|kind| kind != "Service") {
                debug!(
                    route = %name,
                    rule = rule_idx,
                    backend = %backend.name,
                    "unsupported backend kind, skipping"
                );
                continue;
            }
            let backend_ref = BackendRef::new(
                backend.namespace.as_deref().unwrap_or(&namespace),
                backend.name.as_str(),
                backend.port.unwrap_or(DEFAULT_BACKEND_PORT).to_string(),
            );
            for path in &paths {
                if let Err(e) = validate_path(path) {
                    warn!(route = %name, rule = rule_idx, "skipping path: {}", e);
                    continue;
                }
                for host in &hostnames {
                    contribution.add_path(host, path, backend_ref.clone());
                }
            }
        }
    }

    debug!(
        route = %name,
        hostnames = contribution.hostnames.len(),
        backends = contribution.backends.len(),
        "converted HTTPRoute"
    );
    contribution
}
