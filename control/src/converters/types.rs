//! Cache contract used by converters and the reconciler

use super::changes::ChangedObjects;
use crate::error::LookupError;
use async_trait::async_trait;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Pod, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::Ingress;
use std::net::IpAddr;
use std::sync::Arc;

/// Read access to the cluster snapshot plus the pending change set
///
/// Lookups take `namespace`/`name` pairs; cluster scoped objects (nodes) only
/// a name. A missing object is `LookupError::NotFound`.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Hand over the changes accumulated since the previous call
    ///
    /// Atomic: the internal accumulator is left empty, and changes recorded
    /// while the caller works land in the next change set.
    fn swap_changed_objects(&self) -> ChangedObjects;

    fn get_service(&self, namespace: &str, name: &str) -> Result<Arc<Service>, LookupError>;

    /// Legacy Endpoints object of a service
    fn get_endpoints(&self, service: &Service) -> Result<Arc<Endpoints>, LookupError>;

    /// Every EndpointSlice labeled with the service name, possibly none
    fn get_endpoint_slices(&self, service: &Service)
        -> Result<Vec<Arc<EndpointSlice>>, LookupError>;

    fn get_node_by_name(&self, name: &str) -> Result<Arc<Node>, LookupError>;

    /// Pods selected by the service that are shutting down
    fn get_terminating_pods(&self, service: &Service) -> Result<Vec<Arc<Pod>>, LookupError>;

    fn get_ingress_list(&self) -> Vec<Arc<Ingress>>;

    fn get_http_route_list(&self) -> Vec<Arc<HTTPRoute>>;

    fn get_config_map(&self, namespace: &str, name: &str) -> Result<Arc<ConfigMap>, LookupError>;

    /// Resolve an ExternalName service target
    async fn external_name_lookup(&self, name: &str) -> Result<Vec<IpAddr>, LookupError>;
}

/// Namespace of objects named without one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Split `namespace/name`, falling back to `default_namespace` for bare names
pub fn split_name<'a>(full_name: &'a str, default_namespace: &'a str) -> (&'a str, &'a str) {
    match full_name.split_once('/') {
        Some((namespace, name)) => (namespace, name),
        None => (default_namespace, full_name),
    }
}

/// `namespace/name` form of a possibly bare name
pub fn full_name(name: &str, default_namespace: &str) -> String {
    let (namespace, name) = split_name(name, default_namespace);
    format!("{}/{}", namespace, name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_name() {
        assert_eq!(split_name("ingress/global", "default"), ("ingress", "global"));
        assert_eq!(split_name("global", "default"), ("default", "global"));
        assert_eq!(full_name("global", DEFAULT_NAMESPACE), "default/global");
        assert_eq!(full_name("ingress/global", DEFAULT_NAMESPACE), "ingress/global");
    }
}
