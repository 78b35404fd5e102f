//! Gatehouse Common Types
//!
//! Identity types shared by the change model and the dependency tracker, and
//! the resolved `Endpoint` handed over to the proxy configuration generator.
//! Everything here is plain data: no Kubernetes types, no I/O.

use std::collections::BTreeMap;
use std::fmt;

/// Weight assigned to an endpoint when its node does not declare one
pub const DEFAULT_ENDPOINT_WEIGHT: i32 = 50;

/// Smallest accepted node weight
pub const MIN_ENDPOINT_WEIGHT: i32 = 1;

/// Largest accepted node weight
pub const MAX_ENDPOINT_WEIGHT: i32 = 127;

/// Kind of a tracked object
///
/// Cluster resource kinds first, then the kinds the controller computes
/// itself. Ordering is stable and is used to sort `TrackingLinks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceType {
    Ingress,
    IngressClass,
    Gateway,
    GatewayClass,
    HttpRoute,
    ConfigMap,
    Service,
    Endpoints,
    Secret,
    Pod,
    Node,
    /// Computed proxy backend (one per service port)
    Backend,
    /// Computed proxy hostname
    Hostname,
    /// Computed TCP service (from the TCP services ConfigMap)
    TcpService,
    /// Computed user list
    Userlist,
    /// Certificate automation data (one per certificate secret)
    AcmeData,
}

impl ResourceType {
    /// All variants, in sort order
    pub const ALL: [ResourceType; 16] = [
        ResourceType::Ingress,
        ResourceType::IngressClass,
        ResourceType::Gateway,
        ResourceType::GatewayClass,
        ResourceType::HttpRoute,
        ResourceType::ConfigMap,
        ResourceType::Service,
        ResourceType::Endpoints,
        ResourceType::Secret,
        ResourceType::Pod,
        ResourceType::Node,
        ResourceType::Backend,
        ResourceType::Hostname,
        ResourceType::TcpService,
        ResourceType::Userlist,
        ResourceType::AcmeData,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Ingress => "Ingress",
            ResourceType::IngressClass => "IngressClass",
            ResourceType::Gateway => "Gateway",
            ResourceType::GatewayClass => "GatewayClass",
            ResourceType::HttpRoute => "HTTPRoute",
            ResourceType::ConfigMap => "ConfigMap",
            ResourceType::Service => "Service",
            ResourceType::Endpoints => "Endpoints",
            ResourceType::Secret => "Secret",
            ResourceType::Pod => "Pod",
            ResourceType::Node => "Node",
            ResourceType::Backend => "Backend",
            ResourceType::Hostname => "Hostname",
            ResourceType::TcpService => "TCPService",
            ResourceType::Userlist => "Userlist",
            ResourceType::AcmeData => "AcmeData",
        }
    }

    /// True for kinds computed by the controller rather than read from the cluster
    pub const fn is_internal(&self) -> bool {
        matches!(
            self,
            ResourceType::Backend
                | ResourceType::Hostname
                | ResourceType::TcpService
                | ResourceType::Userlist
                | ResourceType::AcmeData
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a trackable object: unique per (kind, name) pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrackingRef {
    pub context: ResourceType,
    pub unique_name: String,
}

impl TrackingRef {
    #[inline]
    pub fn new(context: ResourceType, unique_name: impl Into<String>) -> Self {
        Self {
            context,
            unique_name: unique_name.into(),
        }
    }
}

impl fmt::Display for TrackingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.context, self.unique_name)
    }
}

/// Tracked names grouped by kind
///
/// Names within a kind are kept sorted and de-duplicated, so two sets built
/// from the same links in a different order compare equal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct TrackingLinks(BTreeMap<ResourceType, Vec<String>>);

impl TrackingLinks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a name under a kind. Returns `false` if it was already present.
    pub fn insert(&mut self, context: ResourceType, name: impl Into<String>) -> bool {
        let name = name.into();
        let names = self.0.entry(context).or_default();
        match names.binary_search(&name) {
            Ok(_) => false,
            Err(pos) => {
                names.insert(pos, name);
                true
            }
        }
    }

    pub fn insert_ref(&mut self, tracking_ref: &TrackingRef) -> bool {
        self.insert(tracking_ref.context, tracking_ref.unique_name.clone())
    }

    /// Merge every name of `other` into this set
    pub fn merge(&mut self, other: &TrackingLinks) {
        for (context, names) in other.iter() {
            for name in names {
                self.insert(context, name.clone());
            }
        }
    }

    /// Names tracked under a kind (sorted), empty when none
    pub fn get(&self, context: ResourceType) -> &[String] {
        self.0.get(&context).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, context: ResourceType, name: &str) -> bool {
        self.0
            .get(&context)
            .map(|names| names.binary_search_by(|n| n.as_str().cmp(name)).is_ok())
            .unwrap_or(false)
    }

    /// Remove and return every name tracked under a kind
    pub fn remove(&mut self, context: ResourceType) -> Vec<String> {
        self.0.remove(&context).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Total number of names across all kinds
    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// Iterate kinds in sort order with their names
    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, &[String])> {
        self.0
            .iter()
            .filter(|(_, names)| !names.is_empty())
            .map(|(context, names)| (*context, names.as_slice()))
    }

    /// Iterate every (kind, name) pair as a `TrackingRef`
    pub fn refs(&self) -> impl Iterator<Item = TrackingRef> + '_ {
        self.iter().flat_map(|(context, names)| {
            names
                .iter()
                .map(move |name| TrackingRef::new(context, name.clone()))
        })
    }
}

impl FromIterator<(ResourceType, String)> for TrackingLinks {
    fn from_iter<I: IntoIterator<Item = (ResourceType, String)>>(iter: I) -> Self {
        let mut links = TrackingLinks::new();
        for (context, name) in iter {
            links.insert(context, name);
        }
        links
    }
}

impl FromIterator<TrackingRef> for TrackingLinks {
    fn from_iter<I: IntoIterator<Item = TrackingRef>>(iter: I) -> Self {
        iter.into_iter()
            .map(|r| (r.context, r.unique_name))
            .collect()
    }
}

impl fmt::Display for TrackingLinks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups: Vec<String> = self
            .iter()
            .map(|(context, names)| format!("{}=[{}]", context, names.join(",")))
            .collect();
        write!(f, "{{{}}}", groups.join(" "))
    }
}

/// Resolved network target backing a service
///
/// `target` (`ip:port`) is the sort key that keeps resolved lists stable
/// between reconciliations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Endpoint {
    pub ip: String,
    pub port: i32,
    pub target: String,
    /// `namespace/name` of the workload behind this address, empty if unknown
    pub target_ref: String,
    pub node_name: Option<String>,
    pub weight: i32,
}

impl Endpoint {
    pub fn new(ip: impl Into<String>, port: i32) -> Self {
        let ip = ip.into();
        let target = format!("{}:{}", ip, port);
        Self {
            ip,
            port,
            target,
            target_ref: String::new(),
            node_name: None,
            weight: DEFAULT_ENDPOINT_WEIGHT,
        }
    }

    /// Set the originating workload reference
    pub fn with_target_ref(mut self, namespace: &str, name: &str) -> Self {
        self.target_ref = format!("{}/{}", namespace, name);
        self
    }

    pub fn with_node(mut self, node_name: Option<String>, weight: i32) -> Self {
        self.node_name = node_name;
        self.weight = weight;
        self
    }

    /// True when `weight` lies inside the accepted node weight range
    pub fn has_valid_weight(&self) -> bool {
        (MIN_ENDPOINT_WEIGHT..=MAX_ENDPOINT_WEIGHT).contains(&self.weight)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} weight={}", self.target, self.weight)?;
        if !self.target_ref.is_empty() {
            write!(f, " ref={}", self.target_ref)?;
        }
        if let Some(node) = &self.node_name {
            write!(f, " node={}", node)?;
        }
        Ok(())
    }
}
