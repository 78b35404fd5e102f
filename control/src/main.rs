use anyhow::Result;
use control::acme::{AcmeConnector, ChallengeStore, Connector, Signer, TlsSecretStore};
use control::apis::KubeCache;
use control::config::ControllerConfig;
use control::converters::{Cache, MemoryCache};
use control::reconcile::Reconciler;
use control::server::ControlServer;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Field manager used for server-side apply of certificate secrets
const FIELD_MANAGER: &str = "gatehouse-controller";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize rustls crypto provider (needed for Kubernetes and ACME TLS clients)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok(); // Ignore error if already installed

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ControllerConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    info!(
        controller = %config.controller_name,
        ingress_class = %config.ingress_class,
        endpoint_slices = config.use_endpoint_slices,
        "Starting gatehouse control plane"
    );

    let (cache, store, watcher_handles): (Arc<dyn Cache>, Arc<dyn TlsSecretStore>, Vec<_>) =
        if config.k8s_mode {
            info!("Kubernetes mode enabled - starting watchers");
            let client = kube::Client::try_default().await?;
            let cache = Arc::new(KubeCache::new(
                client,
                config.global_config_map.clone(),
                config.tcp_config_map.clone(),
                FIELD_MANAGER,
            ));
            let handles = cache.spawn_watchers(config.use_endpoint_slices, config.drain_support);
            let lookup: Arc<dyn Cache> = cache.clone();
            let store: Arc<dyn TlsSecretStore> = cache;
            (lookup, store, handles)
        } else {
            info!("Standalone mode - in-memory cache");
            let cache = Arc::new(MemoryCache::new().with_config_maps(
                config.global_config_map.clone(),
                config.tcp_config_map.clone(),
            ));
            let lookup: Arc<dyn Cache> = cache.clone();
            let store: Arc<dyn TlsSecretStore> = cache;
            (lookup, store, Vec::new())
        };

    let challenges = Arc::new(ChallengeStore::new());
    let connector: Arc<dyn Connector> = Arc::new(AcmeConnector::new(challenges.clone()));
    let signer = Signer::new(store, connector);
    let mut reconciler = Reconciler::new(cache, signer, &config);

    let bind_addr = config.control_bind_addr.clone();
    let server = ControlServer::new(challenges);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.serve(&bind_addr).await {
            error!("Control server error: {}", e);
        }
    });

    let mut sync_interval =
        tokio::time::interval(Duration::from_secs(config.sync_interval_secs.max(1)));
    let mut acme_interval =
        tokio::time::interval(Duration::from_secs(config.acme_check_period_secs.max(60)));
    // The first sync already checks every certificate group
    acme_interval.tick().await;

    info!("Press Ctrl-C to exit.");

    loop {
        tokio::select! {
            _ = sync_interval.tick() => {
                reconciler.sync().await;
            }
            _ = acme_interval.tick() => {
                reconciler.check_all_certificates().await;
            }
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    server_handle.abort();
    for handle in watcher_handles {
        handle.abort();
    }

    Ok(())
}
