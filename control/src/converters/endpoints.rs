//! Endpoint Resolver
//!
//! Turns a service port into the canonical ready / not ready address lists,
//! from either the legacy Endpoints object or the service's EndpointSlices,
//! or from DNS for ExternalName services.
//!
//! Every list is sorted by `ip:port`: two resolutions of the same cluster
//! state must compare equal whatever order the API returned objects in.
//!
//! With drain support, terminating pods still holding connections are kept
//! as zero weight endpoints until they are gone.

use super::annotations::{
    node_int_annotation, NODE_WEIGHT_ANNOTATION, SERVICE_UPSTREAM_ANNOTATION,
};
use super::types::Cache;
use crate::error::ControlError;
use gatehouse_common::{
    Endpoint, DEFAULT_ENDPOINT_WEIGHT, MAX_ENDPOINT_WEIGHT, MIN_ENDPOINT_WEIGHT,
};
use k8s_openapi::api::core::v1::{
    EndpointAddress, Endpoints, ObjectReference, Pod, Service, ServicePort,
};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{debug, warn};

const PROTOCOL_TCP: &str = "TCP";

const SERVICE_TYPE_EXTERNAL_NAME: &str = "ExternalName";

/// Resolution result for one service port
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedEndpoints {
    pub ready: Vec<Endpoint>,
    pub not_ready: Vec<Endpoint>,
    /// Terminating pods kept for draining, weight 0
    pub terminating: Vec<Endpoint>,
}

impl ResolvedEndpoints {
    fn sorted(mut self) -> Self {
        self.ready.sort_by(|a, b| a.target.cmp(&b.target));
        self.not_ready.sort_by(|a, b| a.target.cmp(&b.target));
        self.terminating.sort_by(|a, b| a.target.cmp(&b.target));
        self
    }

    fn contains_target(&self, target: &str) -> bool {
        self.ready
            .iter()
            .chain(self.not_ready.iter())
            .any(|ep| ep.target == target)
    }

    /// `namespace/name` of every draining pod
    pub fn terminating_pods(&self) -> Vec<&str> {
        self.terminating
            .iter()
            .map(|ep| ep.target_ref.as_str())
            .filter(|pod| !pod.is_empty())
            .collect()
    }

    /// Source nodes of every resolved endpoint, de-duplicated
    pub fn node_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .ready
            .iter()
            .chain(self.not_ready.iter())
            .filter_map(|ep| ep.node_name.as_deref())
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

/// Resolve the endpoints backing `service_port` of `service`
///
/// Lookup failures are returned untouched; callers keep the previous
/// resolution of the service in that case.
pub async fn create_endpoints(
    cache: &dyn Cache,
    service: &Service,
    service_port: &ServicePort,
    use_endpoint_slices: bool,
) -> Result<ResolvedEndpoints, ControlError> {
    let is_external_name = service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some(SERVICE_TYPE_EXTERNAL_NAME);

    let resolved = if is_external_name {
        ResolvedEndpoints {
            ready: create_endpoints_external_name(cache, service, service_port).await?,
            ..Default::default()
        }
    } else if use_endpoint_slices {
        let slices = cache.get_endpoint_slices(service)?;
        create_endpoint_slices(cache, &slices, service_port)
    } else {
        let endpoints = cache.get_endpoints(service)?;
        create_legacy_endpoints(cache, &endpoints, service_port)
    };

    Ok(resolved.sorted())
}

/// True when the service is reached through its cluster IP
pub fn uses_service_upstream(service: &Service) -> bool {
    service
        .annotations()
        .get(SERVICE_UPSTREAM_ANNOTATION)
        .is_some_and(|value| value.trim() == "true")
}

/// Single endpoint at the service cluster IP
pub fn create_svc_endpoint(
    service: &Service,
    service_port: &ServicePort,
) -> Result<Endpoint, ControlError> {
    if service_port.port <= 0 {
        return Err(ControlError::InvalidPort(service_port.port));
    }
    let cluster_ip = service
        .spec
        .as_ref()
        .and_then(|spec| spec.cluster_ip.clone())
        .unwrap_or_default();
    Ok(Endpoint::new(cluster_ip, service_port.port))
}

/// Find a service port by name, target port, or numeric port
///
/// Names and target ports are checked first over every port, so a port
/// named "8080" wins over a port numbered 8080.
pub fn find_service_port<'a>(service: &'a Service, port: &str) -> Option<&'a ServicePort> {
    let ports = service.spec.as_ref()?.ports.as_ref()?;
    if let Some(found) = ports.iter().find(|p| {
        p.name.as_deref() == Some(port)
            || p.target_port.as_ref().map(int_or_string) == Some(port.to_string())
    }) {
        return Some(found);
    }
    let number: i32 = port.parse().ok()?;
    ports.iter().find(|p| p.port == number)
}

/// Container port a service port targets on `pod`, 0 when unknown
pub fn find_container_port(pod: &Pod, service_port: &ServicePort) -> i32 {
    let target_port = match &service_port.target_port {
        Some(IntOrString::Int(port)) if *port > 0 => return *port,
        Some(IntOrString::String(name)) => match name.parse::<i32>() {
            Ok(port) if port > 0 => return port,
            _ => name.as_str(),
        },
        _ => return 0,
    };
    let protocol = service_port.protocol.as_deref().unwrap_or(PROTOCOL_TCP);

    pod.spec
        .as_ref()
        .into_iter()
        .flat_map(|spec| spec.containers.iter())
        .flat_map(|container| container.ports.iter().flatten())
        .find(|port| {
            port.protocol.as_deref().unwrap_or(PROTOCOL_TCP) == protocol
                && port.name.as_deref() == Some(target_port)
        })
        .map(|port| port.container_port)
        .unwrap_or(0)
}

/// Add the terminating pods of a service as draining endpoints
///
/// Pods without an IP or without a matching container port are skipped, as
/// are addresses the endpoint source still lists.
pub fn add_terminating_endpoints(
    resolved: ResolvedEndpoints,
    pods: &[Arc<Pod>],
    service_port: &ServicePort,
) -> ResolvedEndpoints {
    let mut resolved = resolved;
    for pod in pods {
        let Some(ip) = pod
            .status
            .as_ref()
            .and_then(|status| status.pod_ip.as_deref())
            .filter(|ip| !ip.is_empty())
        else {
            continue;
        };
        let port = find_container_port(pod, service_port);
        if port <= 0 {
            debug!(pod = %pod.name_any(), "terminating pod does not expose the service port");
            continue;
        }
        let node_name = pod.spec.as_ref().and_then(|spec| spec.node_name.clone());
        let endpoint = Endpoint::new(ip, port)
            .with_target_ref(
                pod.namespace().as_deref().unwrap_or_default(),
                &pod.name_any(),
            )
            .with_node(node_name, 0);
        if resolved.contains_target(&endpoint.target)
            || resolved.terminating.iter().any(|ep| ep.target == endpoint.target)
        {
            continue;
        }
        resolved.terminating.push(endpoint);
    }
    resolved.sorted()
}

async fn create_endpoints_external_name(
    cache: &dyn Cache,
    service: &Service,
    service_port: &ServicePort,
) -> Result<Vec<Endpoint>, ControlError> {
    let port = service_port.port;
    if port <= 0 {
        return Err(ControlError::InvalidPort(port));
    }
    let external_name = service
        .spec
        .as_ref()
        .and_then(|spec| spec.external_name.as_deref())
        .unwrap_or_default();
    let addrs = cache.external_name_lookup(external_name).await?;
    Ok(addrs
        .into_iter()
        .map(|ip| Endpoint::new(ip.to_string(), port))
        .collect())
}

fn create_legacy_endpoints(
    cache: &dyn Cache,
    endpoints: &Endpoints,
    service_port: &ServicePort,
) -> ResolvedEndpoints {
    let mut resolved = ResolvedEndpoints::default();
    for subset in endpoints.subsets.iter().flatten() {
        for ep_port in subset.ports.iter().flatten() {
            let protocol = ep_port.protocol.as_deref().unwrap_or(PROTOCOL_TCP);
            if protocol != PROTOCOL_TCP || !match_port_name(service_port, ep_port.name.as_deref())
            {
                continue;
            }
            for addr in subset.addresses.iter().flatten() {
                let weight = node_weight(cache, addr.node_name.as_deref());
                resolved.ready.push(
                    address_endpoint(addr, ep_port.port).with_node(addr.node_name.clone(), weight),
                );
            }
            for addr in subset.not_ready_addresses.iter().flatten() {
                resolved.not_ready.push(address_endpoint(addr, ep_port.port));
            }
        }
    }
    resolved
}

fn create_endpoint_slices(
    cache: &dyn Cache,
    slices: &[Arc<EndpointSlice>],
    service_port: &ServicePort,
) -> ResolvedEndpoints {
    let service_protocol = service_port.protocol.as_deref().unwrap_or(PROTOCOL_TCP);
    let mut resolved = ResolvedEndpoints::default();

    for slice in slices {
        for ep_port in slice.ports.iter().flatten() {
            if ep_port.protocol.as_deref().unwrap_or(PROTOCOL_TCP) != service_protocol {
                continue;
            }
            if !match_port_name(service_port, ep_port.name.as_deref()) {
                continue;
            }
            let Some(port) = ep_port.port else {
                continue;
            };

            for endpoint in &slice.endpoints {
                // the first address is the one kube-proxy uses
                let Some(ip) = endpoint.addresses.first() else {
                    continue;
                };
                let weight = node_weight(cache, endpoint.node_name.as_deref());
                let resolved_ep =
                    with_target_ref(Endpoint::new(ip.clone(), port), endpoint.target_ref.as_ref())
                        .with_node(endpoint.node_name.clone(), weight);

                let ready = endpoint
                    .conditions
                    .as_ref()
                    .and_then(|conditions| conditions.ready)
                    .unwrap_or(true);
                if ready {
                    resolved.ready.push(resolved_ep);
                } else {
                    resolved.not_ready.push(resolved_ep);
                }
            }
        }
    }
    resolved
}

fn match_port_name(service_port: &ServicePort, endpoint_port_name: Option<&str>) -> bool {
    match service_port.name.as_deref() {
        None | Some("") => true,
        Some(name) => endpoint_port_name.unwrap_or_default() == name,
    }
}

fn address_endpoint(addr: &EndpointAddress, port: i32) -> Endpoint {
    with_target_ref(Endpoint::new(addr.ip.clone(), port), addr.target_ref.as_ref())
}

fn with_target_ref(endpoint: Endpoint, target_ref: Option<&ObjectReference>) -> Endpoint {
    match target_ref {
        Some(target) => endpoint.with_target_ref(
            target.namespace.as_deref().unwrap_or_default(),
            target.name.as_deref().unwrap_or_default(),
        ),
        None => endpoint,
    }
}

/// Weight of endpoints running on `node_name`, from its node-weight annotation
pub fn node_weight(cache: &dyn Cache, node_name: Option<&str>) -> i32 {
    let Some(node_name) = node_name else {
        warn!("Searching for weight of node without providing the node name");
        return DEFAULT_ENDPOINT_WEIGHT;
    };

    let node = match cache.get_node_by_name(node_name) {
        Ok(node) => node,
        Err(e) => {
            warn!(node = node_name, error = %e, "Unable to get weight for node");
            return DEFAULT_ENDPOINT_WEIGHT;
        }
    };

    match node_int_annotation(&node, NODE_WEIGHT_ANNOTATION) {
        Ok(weight) if (MIN_ENDPOINT_WEIGHT..=MAX_ENDPOINT_WEIGHT).contains(&weight) => {
            debug!(node = node_name, weight, "Found weight of node");
            weight
        }
        Ok(weight) => {
            warn!(node = node_name, weight, "Invalid node weight");
            DEFAULT_ENDPOINT_WEIGHT
        }
        Err(_) => DEFAULT_ENDPOINT_WEIGHT,
    }
}

fn int_or_string(value: &IntOrString) -> String {
    match value {
        IntOrString::Int(port) => port.to_string(),
        IntOrString::String(name) => name.clone(),
    }
}
