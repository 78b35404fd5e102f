//! In-memory cache
//!
//! Backs standalone mode (no cluster) and tests. Objects are applied and
//! deleted directly; every mutation lands in the pending change set exactly
//! like a watcher event would.

use super::changes::{
    tracking_name_of, ChangeKind, ChangedObjects, TrackedResource, SERVICE_NAME_LABEL,
};
use super::tracker::safe_lock;
use super::types::{full_name, split_name, Cache, DEFAULT_NAMESPACE};
use crate::acme::{tls_secret_object, TlsSecret, TlsSecretStore};
use crate::error::{BoxError, LookupError};
use async_trait::async_trait;
use gatehouse_common::ResourceType;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Pod, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Objects held by a `MemoryCache`, keyed by `namespace/name` (or `name`)
#[derive(Debug, Default)]
pub struct MemoryObjects {
    ingresses: BTreeMap<String, Arc<Ingress>>,
    ingress_classes: BTreeMap<String, Arc<IngressClass>>,
    gateways: BTreeMap<String, Arc<Gateway>>,
    gateway_classes: BTreeMap<String, Arc<GatewayClass>>,
    http_routes: BTreeMap<String, Arc<HTTPRoute>>,
    services: BTreeMap<String, Arc<Service>>,
    endpoints: BTreeMap<String, Arc<Endpoints>>,
    endpoint_slices: BTreeMap<String, Arc<EndpointSlice>>,
    secrets: BTreeMap<String, Arc<Secret>>,
    config_maps: BTreeMap<String, Arc<ConfigMap>>,
    pods: BTreeMap<String, Arc<Pod>>,
    nodes: BTreeMap<String, Arc<Node>>,
}

/// A resource kind a `MemoryCache` can hold
pub trait MemoryKind: TrackedResource + Send + Sync + 'static {
    fn slot(objects: &mut MemoryObjects) -> &mut BTreeMap<String, Arc<Self>>;

    /// Key/value content, for kinds that carry configuration
    fn config_data(&self) -> Option<BTreeMap<String, String>> {
        None
    }
}

macro_rules! memory_kind {
    ($kind:ty, $field:ident) => {
        impl MemoryKind for $kind {
            fn slot(objects: &mut MemoryObjects) -> &mut BTreeMap<String, Arc<Self>> {
                &mut objects.$field
            }
        }
    };
}

memory_kind!(Ingress, ingresses);
memory_kind!(IngressClass, ingress_classes);
memory_kind!(Gateway, gateways);
memory_kind!(GatewayClass, gateway_classes);
memory_kind!(HTTPRoute, http_routes);
memory_kind!(Service, services);
memory_kind!(Endpoints, endpoints);
memory_kind!(EndpointSlice, endpoint_slices);
memory_kind!(Secret, secrets);
memory_kind!(Pod, pods);
memory_kind!(Node, nodes);

impl MemoryKind for ConfigMap {
    fn slot(objects: &mut MemoryObjects) -> &mut BTreeMap<String, Arc<Self>> {
        &mut objects.config_maps
    }

    fn config_data(&self) -> Option<BTreeMap<String, String>> {
        self.data.clone()
    }
}

#[derive(Debug, Default)]
pub struct MemoryCache {
    objects: Mutex<MemoryObjects>,
    dns: Mutex<HashMap<String, Vec<IpAddr>>>,
    changed: Mutex<ChangedObjects>,
    global_config_map: Option<String>,
    tcp_config_map: Option<String>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track config map content diffs for the named maps
    ///
    /// Bare names live in the default namespace.
    pub fn with_config_maps(
        mut self,
        global_config_map: Option<String>,
        tcp_config_map: Option<String>,
    ) -> Self {
        let normalize = |name: Option<String>| {
            name.as_deref()
                .map(|name| full_name(name, DEFAULT_NAMESPACE))
        };
        self.global_config_map = normalize(global_config_map);
        self.tcp_config_map = normalize(tcp_config_map);
        self
    }

    /// Add or replace an object, recording the change
    pub fn apply<K: MemoryKind>(&self, obj: K) {
        let key = tracking_name_of(&obj);
        let obj = Arc::new(obj);
        let previous = {
            let mut objects = safe_lock(&self.objects);
            K::slot(&mut objects).insert(key.clone(), obj.clone())
        };
        let kind = if previous.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Add
        };
        debug!(key = %key, %kind, kind_name = %K::RESOURCE_TYPE, "MemoryCache apply");

        let mut changed = safe_lock(&self.changed);
        self.record_config_map_diff(&mut changed, &key, previous.as_deref(), Some(obj.as_ref()));
        changed.record(kind, obj);
    }

    /// Like `apply`, but skip objects whose resource version is already stored
    ///
    /// Watch resyncs replay unchanged objects; those must not reach the
    /// change set. Returns `false` when the object was skipped.
    pub fn apply_if_changed<K: MemoryKind>(&self, obj: K) -> bool {
        let key = tracking_name_of(&obj);
        let unchanged = obj.resource_version().is_some_and(|version| {
            let mut objects = safe_lock(&self.objects);
            K::slot(&mut objects)
                .get(&key)
                .and_then(|stored| stored.resource_version())
                .is_some_and(|stored| stored == version)
        });
        if unchanged {
            return false;
        }
        self.apply(obj);
        true
    }

    /// Keys of every stored object of a kind
    pub fn keys<K: MemoryKind>(&self) -> Vec<String> {
        let mut objects = safe_lock(&self.objects);
        K::slot(&mut objects).keys().cloned().collect()
    }

    /// Remove an object, recording the deletion. Returns `false` if absent.
    pub fn delete<K: MemoryKind>(&self, namespace: Option<&str>, name: &str) -> bool {
        let key = match namespace {
            Some(namespace) => format!("{}/{}", namespace, name),
            None => name.to_string(),
        };
        let removed = {
            let mut objects = safe_lock(&self.objects);
            K::slot(&mut objects).remove(&key)
        };
        let Some(obj) = removed else {
            return false;
        };
        let mut changed = safe_lock(&self.changed);
        self.record_config_map_diff(&mut changed, &key, Some(obj.as_ref()), None);
        changed.record(ChangeKind::Delete, obj);
        true
    }

    /// Request a complete rebuild on the next cycle
    pub fn request_full_sync(&self) {
        safe_lock(&self.changed).need_full_sync = true;
    }

    /// Addresses returned for an ExternalName lookup
    pub fn set_dns(&self, name: &str, addrs: Vec<IpAddr>) {
        safe_lock(&self.dns).insert(name.to_string(), addrs);
    }

    fn record_config_map_diff<K: MemoryKind>(
        &self,
        changed: &mut ChangedObjects,
        key: &str,
        previous: Option<&K>,
        current: Option<&K>,
    ) {
        if K::RESOURCE_TYPE != ResourceType::ConfigMap {
            return;
        }
        let data = |obj: Option<&K>| obj.and_then(MemoryKind::config_data);
        if self.global_config_map.as_deref() == Some(key) {
            changed.set_global_config(data(previous), data(current));
        }
        if self.tcp_config_map.as_deref() == Some(key) {
            changed.set_tcp_config(data(previous), data(current));
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    fn swap_changed_objects(&self) -> ChangedObjects {
        std::mem::take(&mut *safe_lock(&self.changed))
    }

    fn get_service(&self, namespace: &str, name: &str) -> Result<Arc<Service>, LookupError> {
        let key = format!("{}/{}", namespace, name);
        safe_lock(&self.objects)
            .services
            .get(&key)
            .cloned()
            .ok_or_else(|| LookupError::not_found("Service", key))
    }

    fn get_endpoints(&self, service: &Service) -> Result<Arc<Endpoints>, LookupError> {
        let key = tracking_name_of(service);
        safe_lock(&self.objects)
            .endpoints
            .get(&key)
            .cloned()
            .ok_or_else(|| LookupError::not_found("Endpoints", key))
    }

    fn get_endpoint_slices(
        &self,
        service: &Service,
    ) -> Result<Vec<Arc<EndpointSlice>>, LookupError> {
        let namespace = service.namespace();
        let name = service.name_any();
        Ok(safe_lock(&self.objects)
            .endpoint_slices
            .values()
            .filter(|slice| {
                slice.namespace() == namespace
                    && slice.labels().get(SERVICE_NAME_LABEL) == Some(&name)
            })
            .cloned()
            .collect())
    }

    fn get_node_by_name(&self, name: &str) -> Result<Arc<Node>, LookupError> {
        safe_lock(&self.objects)
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| LookupError::not_found("Node", name))
    }

    fn get_terminating_pods(&self, service: &Service) -> Result<Vec<Arc<Pod>>, LookupError> {
        let Some(selector) = service
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.as_ref())
            .filter(|selector| !selector.is_empty())
        else {
            return Ok(Vec::new());
        };
        let namespace = service.namespace();
        Ok(safe_lock(&self.objects)
            .pods
            .values()
            .filter(|pod| {
                pod.namespace() == namespace
                    && pod.metadata.deletion_timestamp.is_some()
                    && selector
                        .iter()
                        .all(|(key, value)| pod.labels().get(key) == Some(value))
            })
            .cloned()
            .collect())
    }

    fn get_ingress_list(&self) -> Vec<Arc<Ingress>> {
        safe_lock(&self.objects).ingresses.values().cloned().collect()
    }

    fn get_http_route_list(&self) -> Vec<Arc<HTTPRoute>> {
        safe_lock(&self.objects).http_routes.values().cloned().collect()
    }

    fn get_config_map(&self, namespace: &str, name: &str) -> Result<Arc<ConfigMap>, LookupError> {
        let key = format!("{}/{}", namespace, name);
        safe_lock(&self.objects)
            .config_maps
            .get(&key)
            .cloned()
            .ok_or_else(|| LookupError::not_found("ConfigMap", key))
    }

    async fn external_name_lookup(&self, name: &str) -> Result<Vec<IpAddr>, LookupError> {
        safe_lock(&self.dns)
            .get(name)
            .cloned()
            .ok_or_else(|| LookupError::not_found("DNS record", name))
    }
}

#[async_trait]
impl TlsSecretStore for MemoryCache {
    fn get_tls_secret_content(&self, secret_name: &str) -> Option<TlsSecret> {
        let secret = safe_lock(&self.objects).secrets.get(secret_name).cloned()?;
        TlsSecret::from_secret(&secret).ok()
    }

    async fn set_tls_secret_content(
        &self,
        secret_name: &str,
        crt: &[u8],
        key: &[u8],
    ) -> Result<(), BoxError> {
        let (namespace, name) = split_name(secret_name, DEFAULT_NAMESPACE);
        self.apply(tls_secret_object(namespace, name, crt, key));
        Ok(())
    }
}
