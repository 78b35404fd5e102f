//! Reconciliation loop
//!
//! Each cycle swaps the pending change set out of the cache and either
//! rebuilds the whole model (full sync) or only what the dependency tracker
//! reports as affected (partial sync):
//!
//! 1. changed objects are looked up in the tracker, pruning the matched links
//! 2. affected routing sources are converted again, recording fresh links
//! 3. affected backends are resolved again; a failed resolution keeps the
//!    previous endpoints
//! 4. affected certificate groups are checked by the signer
//!
//! Link direction is left to right, "right depends on left": a Service or
//! Endpoints object links to the backends built from it, an Ingress to its
//! backends, hostnames, user lists and certificate groups, a Secret to the
//! Ingresses referencing it, a Node or draining Pod to the backends it serves.

use crate::acme::{CertRequest, CertStatus, Signer};
use crate::apis::metrics;
use crate::config::{AcmeSettings, ControllerConfig};
use crate::converters::changes::{ChangedObjects, TrackedResource};
use crate::converters::endpoints::{
    add_terminating_endpoints, create_endpoints, create_svc_endpoint, find_service_port,
    uses_service_upstream, ResolvedEndpoints,
};
use crate::converters::gateway::{convert_http_route, route_attached};
use crate::converters::ingress::{convert_ingress, IngressClassFilter};
use crate::converters::model::{BackendRef, Contribution, PathRoute, TcpService};
use crate::converters::tcp::convert_tcp_services;
use crate::converters::tracker::Tracker;
use crate::converters::types::{full_name, split_name, Cache, DEFAULT_NAMESPACE};
use crate::error::{ControlError, LookupError};
use gatehouse_common::{ResourceType, TrackingLinks, TrackingRef};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Endpoints of one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendState {
    pub backend: BackendRef,
    pub endpoints: ResolvedEndpoints,
}

/// The resolved routing model handed to the proxy configuration generator
#[derive(Debug, Default)]
pub struct Model {
    contributions: BTreeMap<TrackingRef, Contribution>,
    backends: BTreeMap<String, BackendState>,
}

impl Model {
    pub fn contribution(&self, source: &TrackingRef) -> Option<&Contribution> {
        self.contributions.get(source)
    }

    pub fn contributions(&self) -> impl Iterator<Item = &Contribution> {
        self.contributions.values()
    }

    pub fn backend(&self, id: &str) -> Option<&BackendState> {
        self.backends.get(id)
    }

    pub fn backends(&self) -> impl Iterator<Item = &BackendState> {
        self.backends.values()
    }

    /// Paths of every hostname, merged across sources
    pub fn hostnames(&self) -> BTreeMap<String, Vec<PathRoute>> {
        let mut hostnames: BTreeMap<String, Vec<PathRoute>> = BTreeMap::new();
        for contribution in self.contributions.values() {
            for (host, routes) in &contribution.hostnames {
                let merged = hostnames.entry(host.clone()).or_default();
                merged.extend(routes.iter().cloned());
                merged.sort();
                merged.dedup();
            }
        }
        hostnames
    }

    /// Certificate groups keyed by secret; domains of the same secret are merged
    pub fn cert_groups(&self) -> BTreeMap<String, CertRequest> {
        let mut domains: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for cert in self.contributions.values().flat_map(|c| c.certs.iter()) {
            domains
                .entry(cert.secret_name.clone())
                .or_default()
                .extend(cert.domains.iter().cloned());
        }
        domains
            .into_iter()
            .map(|(secret, domains)| {
                let request = CertRequest::new(secret.as_str(), domains.into_iter().collect());
                (secret, request)
            })
            .collect()
    }

    /// Basic authentication user lists, as `namespace/secret`
    pub fn userlists(&self) -> BTreeSet<&str> {
        self.contributions
            .values()
            .flat_map(|c| c.userlists.iter().map(String::as_str))
            .collect()
    }

    pub fn tcp_services(&self) -> Vec<&TcpService> {
        let mut services: Vec<&TcpService> = self
            .contributions
            .values()
            .flat_map(|c| c.tcp_services.iter())
            .collect();
        services.sort_by_key(|tcp| tcp.port);
        services
    }

    /// Every backend some source references, by id
    fn referenced_backends(&self) -> BTreeMap<String, BackendRef> {
        self.contributions
            .values()
            .flat_map(|c| c.backends.iter())
            .map(|backend| (backend.id(), backend.clone()))
            .collect()
    }
}

/// What a cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Nothing changed, the cycle was skipped
    pub idle: bool,
    pub full_sync: bool,
    /// Computed objects found stale by the tracker
    pub dirty: TrackingLinks,
    /// Sources converted, as `Kind:name`
    pub converted: Vec<String>,
    /// Sources dropped from the model
    pub removed: Vec<String>,
    pub resolved_backends: Vec<String>,
    pub failed_backends: Vec<String>,
    pub dropped_backends: Vec<String>,
    pub issued_certificates: Vec<String>,
    pub failed_certificates: Vec<String>,
}

pub struct Reconciler {
    cache: Arc<dyn Cache>,
    tracker: Tracker,
    signer: Signer,
    filter: IngressClassFilter,
    gateway_name: Option<String>,
    use_endpoint_slices: bool,
    drain_support: bool,
    global_config_map: Option<String>,
    tcp_config_map: Option<String>,
    model: Model,
    initialized: bool,
}

impl Reconciler {
    pub fn new(cache: Arc<dyn Cache>, signer: Signer, config: &ControllerConfig) -> Self {
        Self {
            cache,
            tracker: Tracker::new(),
            signer,
            filter: IngressClassFilter::new(
                config.ingress_class.as_str(),
                config.watch_ingress_without_class,
            ),
            gateway_name: config.gateway_name.clone(),
            use_endpoint_slices: config.use_endpoint_slices,
            drain_support: config.drain_support,
            global_config_map: config
                .global_config_map
                .as_deref()
                .map(|name| full_name(name, DEFAULT_NAMESPACE)),
            tcp_config_map: config
                .tcp_config_map
                .as_deref()
                .map(|name| full_name(name, DEFAULT_NAMESPACE)),
            model: Model::default(),
            initialized: false,
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Run one reconciliation cycle
    pub async fn sync(&mut self) -> CycleReport {
        let changes = self.cache.swap_changed_objects();
        if self.initialized && changes.is_empty() {
            return CycleReport {
                idle: true,
                ..Default::default()
            };
        }

        let start = Instant::now();
        let full_sync = !self.initialized
            || changes.need_full_sync
            || changes.global_config_changed()
            || changes.gateway_changed()
            || !changes.ingress_classes.is_empty();

        let mut report = CycleReport {
            full_sync,
            ..Default::default()
        };

        if full_sync {
            info!(changes = changes.objects.len(), "starting full sync");
            self.full_sync(&mut report).await;
        } else {
            debug!(objects = ?changes.objects, "starting partial sync");
            self.partial_sync(&changes, &mut report).await;
        }
        self.initialized = true;

        let elapsed = start.elapsed().as_secs_f64();
        let sync = if full_sync { "full" } else { "partial" };
        metrics::record_reconcile_cycle(sync, elapsed);
        metrics::set_tracked_links(self.tracker.link_count());
        info!(
            sync,
            converted = report.converted.len(),
            removed = report.removed.len(),
            backends = report.resolved_backends.len(),
            failed_backends = report.failed_backends.len(),
            certificates = report.issued_certificates.len(),
            elapsed_ms = elapsed * 1000.0,
            "reconciliation cycle done"
        );
        report
    }

    /// Check every certificate group, regardless of what changed
    pub async fn check_all_certificates(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let groups: Vec<String> = self.model.cert_groups().into_keys().collect();
        info!(groups = groups.len(), "acme: checking all certificates");
        self.check_certificates(groups.iter().map(String::as_str), &mut report)
            .await;
        report
    }

    async fn full_sync(&mut self, report: &mut CycleReport) {
        self.tracker.clear_links();
        self.apply_global_config().await;

        let previous = std::mem::take(&mut self.model.backends);
        self.model.contributions.clear();

        for ingress in self.cache.get_ingress_list() {
            if self.filter.accepts(&ingress) {
                self.add_contribution(convert_ingress(&ingress), report);
            }
        }

        for route in self.cache.get_http_route_list() {
            if route_attached(route.spec.parent_refs.as_ref(), self.gateway_name.as_deref()) {
                self.add_contribution(convert_http_route(&route), report);
            }
        }

        if let Some(name) = self.tcp_config_map.clone() {
            let (namespace, short) = split_name(&name, DEFAULT_NAMESPACE);
            match self.cache.get_config_map(namespace, short) {
                Ok(config_map) => {
                    let data = config_map.data.clone().unwrap_or_default();
                    self.add_contribution(convert_tcp_services(&name, &data), report);
                }
                Err(e) => warn!("TCP services ConfigMap unavailable: {}", e),
            }
        }

        for (id, backend) in self.model.referenced_backends() {
            if let Some(state) = previous.get(&id) {
                self.model.backends.insert(id.clone(), state.clone());
            }
            self.update_backend(&id, &backend, report).await;
        }

        let groups: Vec<String> = self.model.cert_groups().into_keys().collect();
        self.check_certificates(groups.iter().map(String::as_str), report)
            .await;
    }

    async fn partial_sync(&mut self, changes: &ChangedObjects, report: &mut CycleReport) {
        let input = changes.tracking_input();
        let mut dirty = self.tracker.query_links(&input, true);

        let mut ingress_names: BTreeSet<String> = changes
            .ingresses
            .all()
            .map(|ingress| ingress.tracking_name())
            .collect();
        ingress_names.extend(dirty.get(ResourceType::Ingress).iter().cloned());

        if !ingress_names.is_empty() {
            let current: BTreeMap<String, _> = self
                .cache
                .get_ingress_list()
                .into_iter()
                .map(|ingress| (ingress.tracking_name(), ingress))
                .collect();

            for name in ingress_names {
                let source = TrackingRef::new(ResourceType::Ingress, name.as_str());
                let existed = self.remove_contribution(&source, &mut dirty);
                match current.get(&name) {
                    Some(ingress) if self.filter.accepts(ingress) => {
                        let contribution = convert_ingress(ingress);
                        mark_outputs(&contribution, &mut dirty);
                        self.add_contribution(contribution, report);
                    }
                    _ if existed => {
                        debug!(ingress = %name, "ingress removed or no longer watched");
                        report.removed.push(source.to_string());
                    }
                    _ => {}
                }
            }
        }

        if changes.tcp_config_changed() {
            if let Some(name) = self.tcp_config_map.clone() {
                let source = TrackingRef::new(ResourceType::ConfigMap, name.as_str());
                let existed = self.remove_contribution(&source, &mut dirty);
                match changes
                    .tcp_config_map_data_new
                    .as_ref()
                    .filter(|data| !data.is_empty())
                {
                    Some(data) => {
                        let contribution = convert_tcp_services(&name, data);
                        mark_outputs(&contribution, &mut dirty);
                        self.add_contribution(contribution, report);
                    }
                    None if existed => report.removed.push(source.to_string()),
                    None => {}
                }
            }
        }

        let referenced = self.model.referenced_backends();
        for id in dirty.get(ResourceType::Backend).to_vec() {
            match referenced.get(&id) {
                Some(backend) => self.update_backend(&id, backend, report).await,
                None => {
                    if self.model.backends.remove(&id).is_some() {
                        debug!(backend = %id, "backend no longer referenced");
                        report.dropped_backends.push(id);
                    }
                }
            }
        }

        let groups = dirty.get(ResourceType::AcmeData).to_vec();
        self.check_certificates(groups.iter().map(String::as_str), report)
            .await;

        report.dirty = dirty;
    }

    /// Drop a source from the model, marking everything it produced as dirty
    ///
    /// Returns `true` if the source was part of the model.
    fn remove_contribution(&mut self, source: &TrackingRef, dirty: &mut TrackingLinks) -> bool {
        let mut input = TrackingLinks::new();
        input.insert_ref(source);
        dirty.merge(&self.tracker.query_links(&input, true));

        match self.model.contributions.remove(source) {
            Some(old) => {
                mark_outputs(&old, dirty);
                true
            }
            None => false,
        }
    }

    fn add_contribution(&mut self, contribution: Contribution, report: &mut CycleReport) {
        contribution.track(&self.tracker);
        report.converted.push(contribution.source.to_string());
        self.model
            .contributions
            .insert(contribution.source.clone(), contribution);
    }

    /// Resolve a backend, keeping the previous endpoints on failure
    ///
    /// Service and Endpoints links are recorded before resolving, so a
    /// failed lookup is retried as soon as the missing object shows up.
    async fn update_backend(
        &mut self,
        id: &str,
        backend: &BackendRef,
        report: &mut CycleReport,
    ) {
        let service_name = backend.service_name();
        self.tracker.track_ref_name(
            &[
                TrackingRef::new(ResourceType::Service, service_name.as_str()),
                TrackingRef::new(ResourceType::Endpoints, service_name.as_str()),
            ],
            ResourceType::Backend,
            id,
        );

        match self.resolve_backend(backend).await {
            Ok(endpoints) => {
                for node in endpoints.node_names() {
                    self.tracker
                        .track_names(ResourceType::Node, node, ResourceType::Backend, id);
                }
                for pod in endpoints.terminating_pods() {
                    self.tracker
                        .track_names(ResourceType::Pod, pod, ResourceType::Backend, id);
                }
                debug!(
                    backend = %backend,
                    ready = endpoints.ready.len(),
                    not_ready = endpoints.not_ready.len(),
                    terminating = endpoints.terminating.len(),
                    "backend resolved"
                );
                self.model.backends.insert(
                    id.to_string(),
                    BackendState {
                        backend: backend.clone(),
                        endpoints,
                    },
                );
                report.resolved_backends.push(id.to_string());
            }
            Err(e) => {
                warn!(
                    backend = %backend,
                    error = %e,
                    "endpoint resolution failed, keeping previous endpoints"
                );
                metrics::record_endpoint_resolution_failure(&service_name);
                report.failed_backends.push(id.to_string());
            }
        }
    }

    async fn resolve_backend(
        &self,
        backend: &BackendRef,
    ) -> Result<ResolvedEndpoints, ControlError> {
        let service = self
            .cache
            .get_service(&backend.namespace, &backend.service)?;
        let service_port = find_service_port(&service, &backend.port)
            .ok_or_else(|| LookupError::not_found("service port", backend.to_string()))?;

        if uses_service_upstream(&service) {
            return Ok(ResolvedEndpoints {
                ready: vec![create_svc_endpoint(&service, service_port)?],
                ..Default::default()
            });
        }

        let resolved = create_endpoints(
            self.cache.as_ref(),
            &service,
            service_port,
            self.use_endpoint_slices,
        )
        .await?;
        if !self.drain_support {
            return Ok(resolved);
        }
        let pods = self.cache.get_terminating_pods(&service)?;
        Ok(add_terminating_endpoints(resolved, &pods, service_port))
    }

    /// Notify the signer of each group; a failing group does not stop the others
    async fn check_certificates<'a>(
        &mut self,
        secrets: impl Iterator<Item = &'a str>,
        report: &mut CycleReport,
    ) {
        if !self.signer.has_account() {
            debug!("acme: no account configured, skipping certificate checks");
            return;
        }
        let groups = self.model.cert_groups();
        for secret in secrets {
            let Some(request) = groups.get(secret) else {
                debug!(secret, "acme: certificate group no longer requested");
                continue;
            };
            match self.signer.notify_request(request).await {
                Ok(CertStatus::Issued) => report.issued_certificates.push(secret.to_string()),
                Ok(CertStatus::UpToDate) => {}
                Err(e) => {
                    error!(secret, error = %e, "acme: certificate check failed");
                    report.failed_certificates.push(secret.to_string());
                }
            }
        }
    }

    /// Apply the ACME settings of the global ConfigMap
    async fn apply_global_config(&mut self) {
        let data = match self.global_config_map.as_deref() {
            Some(name) => {
                let (namespace, short) = split_name(name, DEFAULT_NAMESPACE);
                match self.cache.get_config_map(namespace, short) {
                    Ok(config_map) => config_map.data.clone().unwrap_or_default(),
                    Err(e) => {
                        warn!("global ConfigMap unavailable, using defaults: {}", e);
                        BTreeMap::new()
                    }
                }
            }
            None => BTreeMap::new(),
        };
        let settings = AcmeSettings::from_config_map(&data);
        self.signer.acme_config(settings.expiring());
        self.signer
            .acme_account(&settings.endpoint, &settings.emails, settings.terms_agreed)
            .await;
    }
}

/// Mark every computed object of a contribution as dirty
fn mark_outputs(contribution: &Contribution, dirty: &mut TrackingLinks) {
    for backend in &contribution.backends {
        dirty.insert(ResourceType::Backend, backend.id());
    }
    for host in contribution.hostnames.keys() {
        dirty.insert(ResourceType::Hostname, host.as_str());
    }
    for userlist in &contribution.userlists {
        dirty.insert(ResourceType::Userlist, userlist.as_str());
    }
    for cert in &contribution.certs {
        dirty.insert(ResourceType::AcmeData, cert.secret_name.as_str());
    }
    for tcp in &contribution.tcp_services {
        dirty.insert(ResourceType::TcpService, tcp.port.to_string());
    }
}
