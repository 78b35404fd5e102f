//! Cluster backed cache
//!
//! One watcher task per resource kind feeds a `MemoryCache` snapshot, so
//! lookups and change accounting behave exactly as in standalone mode.
//! Certificates are written back with server-side apply; the Secret watcher
//! then brings them into the snapshot like any other change.

use crate::acme::{tls_secret_object, TlsSecret, TlsSecretStore};
use crate::converters::changes::{tracking_name_of, ChangedObjects};
use crate::converters::memory::{MemoryCache, MemoryKind};
use crate::converters::types::{split_name, Cache, DEFAULT_NAMESPACE};
use crate::error::{BoxError, LookupError};
use async_trait::async_trait;
use futures::StreamExt;
use gateway_api::apis::standard::gatewayclasses::GatewayClass;
use gateway_api::apis::standard::gateways::Gateway;
use gateway_api::apis::standard::httproutes::HTTPRoute;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Node, Pod, Secret, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cache fed by Kubernetes watchers
pub struct KubeCache {
    client: Client,
    snapshot: Arc<MemoryCache>,
    field_manager: String,
}

impl KubeCache {
    pub fn new(
        client: Client,
        global_config_map: Option<String>,
        tcp_config_map: Option<String>,
        field_manager: impl Into<String>,
    ) -> Self {
        let snapshot =
            Arc::new(MemoryCache::new().with_config_maps(global_config_map, tcp_config_map));
        Self {
            client,
            snapshot,
            field_manager: field_manager.into(),
        }
    }

    /// Start one watcher per resource kind
    ///
    /// Only one of Endpoints and EndpointSlice is watched, following the
    /// endpoint source in use. Pods are only watched for drain support.
    pub fn spawn_watchers(
        &self,
        use_endpoint_slices: bool,
        drain_support: bool,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            self.spawn_watcher::<Ingress>("Ingress"),
            self.spawn_watcher::<IngressClass>("IngressClass"),
            self.spawn_watcher::<Gateway>("Gateway"),
            self.spawn_watcher::<GatewayClass>("GatewayClass"),
            self.spawn_watcher::<HTTPRoute>("HTTPRoute"),
            self.spawn_watcher::<Service>("Service"),
            self.spawn_watcher::<Secret>("Secret"),
            self.spawn_watcher::<ConfigMap>("ConfigMap"),
            self.spawn_watcher::<Node>("Node"),
        ];
        if drain_support {
            handles.push(self.spawn_watcher::<Pod>("Pod"));
        }
        if use_endpoint_slices {
            handles.push(self.spawn_watcher::<EndpointSlice>("EndpointSlice"));
        } else {
            handles.push(self.spawn_watcher::<Endpoints>("Endpoints"));
        }
        handles
    }

    fn spawn_watcher<K>(&self, kind: &'static str) -> JoinHandle<()>
    where
        K: MemoryKind + Resource + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let snapshot = self.snapshot.clone();
        tokio::spawn(async move {
            if let Err(e) = watch_kind(api, snapshot, kind).await {
                tracing::error!("{} watcher error: {}", kind, e);
            }
        })
    }
}

/// Apply watch events of one kind to the snapshot
///
/// After a re-list, objects missing from the new list were deleted while
/// the watch was down and are removed from the snapshot.
async fn watch_kind<K>(
    api: Api<K>,
    snapshot: Arc<MemoryCache>,
    kind: &'static str,
) -> Result<(), BoxError>
where
    K: MemoryKind + Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let watcher = watcher(api, WatcherConfig::default()).default_backoff();

    futures::pin_mut!(watcher);

    info!("Starting {} watcher", kind);

    let mut relisted: Option<HashSet<String>> = None;

    while let Some(event) = watcher.next().await {
        match event {
            Ok(watcher::Event::Apply(obj)) => {
                snapshot.apply_if_changed(obj);
            }
            Ok(watcher::Event::InitApply(obj)) => {
                if let Some(seen) = relisted.as_mut() {
                    seen.insert(tracking_name_of(&obj));
                }
                snapshot.apply_if_changed(obj);
            }
            Ok(watcher::Event::Delete(obj)) => {
                snapshot.delete::<K>(obj.namespace().as_deref(), &obj.name_any());
            }
            Ok(watcher::Event::Init) => {
                debug!("{} watcher initialized", kind);
                relisted = Some(HashSet::new());
            }
            Ok(watcher::Event::InitDone) => {
                if let Some(seen) = relisted.take() {
                    for key in snapshot.keys::<K>() {
                        if !seen.contains(&key) {
                            let (namespace, name) = match key.split_once('/') {
                                Some((namespace, name)) => (Some(namespace), name),
                                None => (None, key.as_str()),
                            };
                            debug!("{} {} vanished during re-list", kind, key);
                            snapshot.delete::<K>(namespace, name);
                        }
                    }
                }
                info!("{} watcher initial sync complete", kind);
            }
            Err(e) => {
                warn!("{} watcher error: {}", kind, e);
            }
        }
    }

    Ok(())
}

#[async_trait]
impl Cache for KubeCache {
    fn swap_changed_objects(&self) -> ChangedObjects {
        self.snapshot.swap_changed_objects()
    }

    fn get_service(&self, namespace: &str, name: &str) -> Result<Arc<Service>, LookupError> {
        self.snapshot.get_service(namespace, name)
    }

    fn get_endpoints(&self, service: &Service) -> Result<Arc<Endpoints>, LookupError> {
        self.snapshot.get_endpoints(service)
    }

    fn get_endpoint_slices(
        &self,
        service: &Service,
    ) -> Result<Vec<Arc<EndpointSlice>>, LookupError> {
        self.snapshot.get_endpoint_slices(service)
    }

    fn get_node_by_name(&self, name: &str) -> Result<Arc<Node>, LookupError> {
        self.snapshot.get_node_by_name(name)
    }

    fn get_terminating_pods(&self, service: &Service) -> Result<Vec<Arc<Pod>>, LookupError> {
        self.snapshot.get_terminating_pods(service)
    }

    fn get_ingress_list(&self) -> Vec<Arc<Ingress>> {
        self.snapshot.get_ingress_list()
    }

    fn get_http_route_list(&self) -> Vec<Arc<HTTPRoute>> {
        self.snapshot.get_http_route_list()
    }

    fn get_config_map(&self, namespace: &str, name: &str) -> Result<Arc<ConfigMap>, LookupError> {
        self.snapshot.get_config_map(namespace, name)
    }

    async fn external_name_lookup(&self, name: &str) -> Result<Vec<IpAddr>, LookupError> {
        let addrs = tokio::net::lookup_host((name, 0))
            .await
            .map_err(|source| LookupError::Dns {
                name: name.to_string(),
                source,
            })?;
        let mut ips: Vec<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

#[async_trait]
impl TlsSecretStore for KubeCache {
    fn get_tls_secret_content(&self, secret_name: &str) -> Option<TlsSecret> {
        self.snapshot.get_tls_secret_content(secret_name)
    }

    async fn set_tls_secret_content(
        &self,
        secret_name: &str,
        crt: &[u8],
        key: &[u8],
    ) -> Result<(), BoxError> {
        let (namespace, name) = split_name(secret_name, DEFAULT_NAMESPACE);
        let secret = tls_secret_object(namespace, name, crt, key);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.patch(
            name,
            &PatchParams::apply(&self.field_manager).force(),
            &Patch::Apply(&secret),
        )
        .await?;
        info!("Stored certificate in Secret {}/{}", namespace, name);
        Ok(())
    }
}
