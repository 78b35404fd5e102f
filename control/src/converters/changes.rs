//! Snapshot diff model
//!
//! `ChangedObjects` accumulates everything the watchers observed since the
//! last reconciliation. The cache hands it over exactly once per cycle
//! (`Cache::swap_changed_objects`), leaving an empty accumulator behind.

use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use gatehouse_common::{ResourceType, TrackingLinks};
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Pod, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Label carrying the owning Service name on an EndpointSlice
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

/// Kind of change observed on a single object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Add,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeKind::Add => "add",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "del",
        })
    }
}

/// Deleted, updated and added objects of one kind
#[derive(Debug, Clone)]
pub struct Changes<K> {
    pub del: Vec<Arc<K>>,
    pub upd: Vec<Arc<K>>,
    pub add: Vec<Arc<K>>,
}

impl<K> Default for Changes<K> {
    fn default() -> Self {
        Self {
            del: Vec::new(),
            upd: Vec::new(),
            add: Vec::new(),
        }
    }
}

impl<K> Changes<K> {
    pub fn push(&mut self, kind: ChangeKind, obj: Arc<K>) {
        match kind {
            ChangeKind::Add => self.add.push(obj),
            ChangeKind::Update => self.upd.push(obj),
            ChangeKind::Delete => self.del.push(obj),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.del.is_empty() && self.upd.is_empty() && self.add.is_empty()
    }

    /// Every object regardless of the kind of change
    pub fn all(&self) -> impl Iterator<Item = &Arc<K>> {
        self.del.iter().chain(self.upd.iter()).chain(self.add.iter())
    }

    /// Added and updated objects, i.e. the ones still present in the cluster
    pub fn present(&self) -> impl Iterator<Item = &Arc<K>> {
        self.upd.iter().chain(self.add.iter())
    }
}

/// One reconciliation cycle's diff of cluster state
#[derive(Debug, Clone, Default)]
pub struct ChangedObjects {
    pub global_config_map_data_cur: Option<BTreeMap<String, String>>,
    pub global_config_map_data_new: Option<BTreeMap<String, String>>,
    pub tcp_config_map_data_cur: Option<BTreeMap<String, String>>,
    pub tcp_config_map_data_new: Option<BTreeMap<String, String>>,
    pub ingresses: Changes<Ingress>,
    pub ingress_classes: Changes<IngressClass>,
    pub gateways: Changes<Gateway>,
    pub gateway_classes: Changes<GatewayClass>,
    pub http_routes: Changes<HTTPRoute>,
    pub endpoints_new: Vec<Arc<Endpoints>>,
    pub endpoint_slices_upd: Vec<Arc<EndpointSlice>>,
    pub services: Changes<Service>,
    pub secrets: Changes<Secret>,
    pub config_maps: Changes<ConfigMap>,
    pub pods_new: Vec<Arc<Pod>>,
    pub nodes_upd: Vec<Arc<Node>>,
    /// Forces a complete rebuild regardless of the finer grained diff
    pub need_full_sync: bool,
    /// Human readable change descriptions, e.g. `update/Secret:default/tls`
    pub objects: Vec<String>,
    /// Links explicitly requested by the cache for this cycle
    pub links: TrackingLinks,
}

impl ChangedObjects {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a change of any tracked kind
    pub fn record<K: TrackedResource>(&mut self, kind: ChangeKind, obj: Arc<K>) {
        self.objects.push(format!(
            "{}/{}:{}",
            kind,
            K::RESOURCE_TYPE,
            obj.tracking_name()
        ));
        K::store(self, kind, obj);
    }

    pub fn set_global_config(
        &mut self,
        cur: Option<BTreeMap<String, String>>,
        new: Option<BTreeMap<String, String>>,
    ) {
        // keep the oldest "cur" when several updates land in the same cycle
        if self.global_config_map_data_new.is_none() {
            self.global_config_map_data_cur = cur;
        }
        self.global_config_map_data_new = Some(new.unwrap_or_default());
    }

    pub fn set_tcp_config(
        &mut self,
        cur: Option<BTreeMap<String, String>>,
        new: Option<BTreeMap<String, String>>,
    ) {
        if self.tcp_config_map_data_new.is_none() {
            self.tcp_config_map_data_cur = cur;
        }
        self.tcp_config_map_data_new = Some(new.unwrap_or_default());
    }

    /// True when the global ConfigMap content actually changed
    pub fn global_config_changed(&self) -> bool {
        match &self.global_config_map_data_new {
            Some(new) => self.global_config_map_data_cur.as_ref() != Some(new),
            None => false,
        }
    }

    /// True when the TCP services ConfigMap content actually changed
    pub fn tcp_config_changed(&self) -> bool {
        match &self.tcp_config_map_data_new {
            Some(new) => self.tcp_config_map_data_cur.as_ref() != Some(new),
            None => false,
        }
    }

    /// True when a gateway family object changed
    ///
    /// Gateway API objects are only converted on full synchronization.
    pub fn gateway_changed(&self) -> bool {
        !self.gateways.is_empty()
            || !self.gateway_classes.is_empty()
            || !self.http_routes.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        !self.need_full_sync
            && self.global_config_map_data_new.is_none()
            && self.tcp_config_map_data_new.is_none()
            && self.ingresses.is_empty()
            && self.ingress_classes.is_empty()
            && !self.gateway_changed()
            && self.endpoints_new.is_empty()
            && self.endpoint_slices_upd.is_empty()
            && self.services.is_empty()
            && self.secrets.is_empty()
            && self.config_maps.is_empty()
            && self.pods_new.is_empty()
            && self.nodes_upd.is_empty()
            && self.objects.is_empty()
            && self.links.is_empty()
    }

    /// Tracking identities of every changed cluster object
    ///
    /// This is the input of the dependency tracker query: whatever is linked
    /// from these refs must be recomputed.
    pub fn tracking_input(&self) -> TrackingLinks {
        let mut input = self.links.clone();
        add_refs(&mut input, self.ingresses.all());
        add_refs(&mut input, self.ingress_classes.all());
        add_refs(&mut input, self.gateways.all());
        add_refs(&mut input, self.gateway_classes.all());
        add_refs(&mut input, self.http_routes.all());
        add_refs(&mut input, self.endpoints_new.iter());
        add_refs(&mut input, self.endpoint_slices_upd.iter());
        add_refs(&mut input, self.services.all());
        add_refs(&mut input, self.secrets.all());
        add_refs(&mut input, self.config_maps.all());
        add_refs(&mut input, self.pods_new.iter());
        add_refs(&mut input, self.nodes_upd.iter());
        input
    }
}

fn add_refs<'a, K: TrackedResource + 'a>(
    input: &mut TrackingLinks,
    objs: impl Iterator<Item = &'a Arc<K>>,
) {
    for obj in objs {
        input.insert(K::RESOURCE_TYPE, obj.tracking_name());
    }
}

/// Name an object is tracked under: `namespace/name`, or `name` when cluster scoped
pub fn tracking_name_of<K: ResourceExt>(obj: &K) -> String {
    match obj.namespace() {
        Some(namespace) => format!("{}/{}", namespace, obj.name_any()),
        None => obj.name_any(),
    }
}

/// A cluster resource kind the cache tracks changes for
pub trait TrackedResource: ResourceExt + Sized {
    const RESOURCE_TYPE: ResourceType;

    /// Place the object in its slot of the change set
    fn store(changes: &mut ChangedObjects, kind: ChangeKind, obj: Arc<Self>);

    fn tracking_name(&self) -> String {
        tracking_name_of(self)
    }
}

macro_rules! tracked_triple {
    ($kind:ty, $resource:expr, $field:ident) => {
        impl TrackedResource for $kind {
            const RESOURCE_TYPE: ResourceType = $resource;

            fn store(changes: &mut ChangedObjects, kind: ChangeKind, obj: Arc<Self>) {
                changes.$field.push(kind, obj);
            }
        }
    };
}

tracked_triple!(Ingress, ResourceType::Ingress, ingresses);
tracked_triple!(IngressClass, ResourceType::IngressClass, ingress_classes);
tracked_triple!(Gateway, ResourceType::Gateway, gateways);
tracked_triple!(GatewayClass, ResourceType::GatewayClass, gateway_classes);
tracked_triple!(HTTPRoute, ResourceType::HttpRoute, http_routes);
tracked_triple!(Service, ResourceType::Service, services);
tracked_triple!(Secret, ResourceType::Secret, secrets);
tracked_triple!(ConfigMap, ResourceType::ConfigMap, config_maps);

impl TrackedResource for Endpoints {
    const RESOURCE_TYPE: ResourceType = ResourceType::Endpoints;

    fn store(changes: &mut ChangedObjects, _kind: ChangeKind, obj: Arc<Self>) {
        changes.endpoints_new.push(obj);
    }
}

impl TrackedResource for EndpointSlice {
    const RESOURCE_TYPE: ResourceType = ResourceType::Endpoints;

    fn store(changes: &mut ChangedObjects, _kind: ChangeKind, obj: Arc<Self>) {
        changes.endpoint_slices_upd.push(obj);
    }

    /// Slices are tracked under their Service, like the legacy Endpoints object
    fn tracking_name(&self) -> String {
        let service = self
            .labels()
            .get(SERVICE_NAME_LABEL)
            .cloned()
            .unwrap_or_else(|| self.name_any());
        match self.namespace() {
            Some(namespace) => format!("{}/{}", namespace, service),
            None => service,
        }
    }
}

impl TrackedResource for Pod {
    const RESOURCE_TYPE: ResourceType = ResourceType::Pod;

    fn store(changes: &mut ChangedObjects, _kind: ChangeKind, obj: Arc<Self>) {
        changes.pods_new.push(obj);
    }
}

impl TrackedResource for Node {
    const RESOURCE_TYPE: ResourceType = ResourceType::Node;

    fn store(changes: &mut ChangedObjects, _kind: ChangeKind, obj: Arc<Self>) {
        changes.nodes_upd.push(obj);
    }
}
