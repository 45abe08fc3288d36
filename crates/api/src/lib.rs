//! klens in-process query facade.
//!
//! [`KlensApi`] is the stable surface frontends depend on; [`Browser`] is the
//! in-process implementation wiring the catalog cache to the informer fleet.

#![forbid(unsafe_code)]

mod singleflight;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use klens_core::{Object, ResourceDescriptor, ResourceId, Result};
use klens_discovery::{CatalogCache, DiscoveryReader, DEFAULT_CATALOG_TTL};
use klens_fleet::{CacheStats, InformerManager, StrategyConfig, StrategyManager};
use kube::Client;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::singleflight::SingleFlight;

/// How long bootstrap waits for the preload signal before serving with a
/// partial cache.
const PRELOAD_WAIT: Duration = Duration::from_secs(60);
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Payload of the non-blocking objects query.
#[derive(Debug, Clone, Serialize)]
pub struct FastObjects {
    pub objects: Vec<Object>,
    pub loading: bool,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStatus {
    pub preload_complete: bool,
    pub ready_resources: usize,
    pub total_informers: usize,
    pub total_objects: usize,
    pub uptime: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub uptime: String,
    pub average_sync_ms: u64,
    pub total_sync_count: usize,
}

/// The query surface: catalog, objects (blocking and fallback), namespaces
/// and observability.
#[async_trait::async_trait]
pub trait KlensApi: Send + Sync {
    async fn catalog(&self) -> Result<Vec<ResourceDescriptor>>;

    /// Authoritative snapshot; waits for readiness up to the configured
    /// bound. `namespace` empty means every namespace; the `"core"` group
    /// sentinel maps to the empty group.
    async fn objects(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        namespace: &str,
    ) -> Result<Vec<Object>>;

    /// Non-blocking variant for UIs: empty + `loading=true` while the kind
    /// syncs.
    async fn objects_fast(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        namespace: &str,
    ) -> Result<FastObjects>;

    /// Sorted distinct namespaces of a kind; empty for cluster-scoped kinds.
    async fn namespaces_for(
        &self,
        group: &str,
        version: &str,
        resource: &str,
    ) -> Result<Vec<String>>;

    fn cache_stats(&self) -> CacheStats;
    fn cache_status(&self) -> CacheStatus;
    fn performance_stats(&self) -> PerformanceStats;

    /// Service readiness: true once preload has completed.
    fn is_ready(&self) -> bool;
}

/// In-process implementation over the catalog cache and the strategy manager.
pub struct Browser {
    catalog: Arc<CatalogCache>,
    strategy: StrategyManager,
    flights: SingleFlight,
    started_at: Instant,
    ready: AtomicBool,
    stop: watch::Sender<bool>,
}

impl Browser {
    pub fn new(client: Client, config: StrategyConfig) -> Arc<Self> {
        let reader = DiscoveryReader::new(client.clone());
        let catalog = Arc::new(CatalogCache::new(reader));
        let manager = Arc::new(InformerManager::new(client));
        Self::from_parts(catalog, manager, config)
    }

    /// Assemble from pre-built parts; tests wire stub catalogs and scripted
    /// watch providers through here.
    pub fn from_parts(
        catalog: Arc<CatalogCache>,
        manager: Arc<InformerManager>,
        config: StrategyConfig,
    ) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            catalog,
            strategy: StrategyManager::new(manager, config),
            flights: SingleFlight::new(),
            started_at: Instant::now(),
            ready: AtomicBool::new(false),
            stop,
        })
    }

    /// Prime the catalog, kick off the core preload, and spawn the
    /// background loops: readiness flip on preload-complete, the periodic
    /// stats log, and the catalog refresh that retires kinds the cluster no
    /// longer serves.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<()> {
        let catalog = self.catalog.get().await?;
        info!(resources = catalog.len(), "catalog primed; starting preload");
        self.strategy.preload(&catalog);

        let me = self.clone();
        tokio::spawn(async move {
            if let Err(e) = me.strategy.wait_preload_complete(PRELOAD_WAIT).await {
                warn!(error = %e, "preload incomplete; serving with partial cache");
            }
            me.ready.store(true, Ordering::Release);
            info!("service is ready");
        });

        let me = self.clone();
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATS_LOG_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = ticker.tick() => {
                        let stats = me.strategy.cache_stats();
                        debug!(
                            active = stats.active_informers,
                            ready = me.strategy.ready_resources_count(),
                            objects = stats.total_objects,
                            "cache stats"
                        );
                    }
                }
            }
        });

        let me = self.clone();
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEFAULT_CATALOG_TTL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = stop.changed() => return,
                    _ = ticker.tick() => match me.catalog.get().await {
                        Ok(catalog) => me.strategy.retire_missing(&catalog),
                        Err(e) => warn!(error = %e, "catalog refresh failed"),
                    }
                }
            }
        });

        Ok(())
    }

    pub fn shutdown(&self) {
        info!("shutting down browser");
        self.ready.store(false, Ordering::Release);
        let _ = self.stop.send(true);
        self.strategy.shutdown();
    }

    fn uptime(&self) -> String {
        format!("{:?}", self.started_at.elapsed())
    }
}

#[async_trait::async_trait]
impl KlensApi for Browser {
    async fn catalog(&self) -> Result<Vec<ResourceDescriptor>> {
        let entry = self.flights.entry("catalog");
        let _guard = entry.lock().await;
        let catalog = self.catalog.get().await?;
        Ok(catalog.as_ref().clone())
    }

    async fn objects(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        namespace: &str,
    ) -> Result<Vec<Object>> {
        let id = ResourceId::from_path(group, version, resource);
        let entry = self.flights.entry(&format!(
            "objects_{}_{}_{}_{}",
            id.group, id.version, id.resource, namespace
        ));
        let _guard = entry.lock().await;

        let t0 = Instant::now();
        let namespaced = self.catalog.lookup_namespaced(&id).await?;
        let objects = self.strategy.get_objects(&id, namespace, namespaced).await?;
        debug!(
            rid = %id,
            namespace = %namespace,
            count = objects.len(),
            took_ms = t0.elapsed().as_millis() as u64,
            "objects served"
        );
        Ok(objects)
    }

    async fn objects_fast(
        &self,
        group: &str,
        version: &str,
        resource: &str,
        namespace: &str,
    ) -> Result<FastObjects> {
        let id = ResourceId::from_path(group, version, resource);
        let namespaced = self.catalog.lookup_namespaced(&id).await?;
        let snapshot = self
            .strategy
            .get_objects_with_fallback(&id, namespace, namespaced)
            .await;
        Ok(FastObjects {
            count: snapshot.objects.len(),
            loading: snapshot.loading,
            objects: snapshot.objects,
        })
    }

    async fn namespaces_for(
        &self,
        group: &str,
        version: &str,
        resource: &str,
    ) -> Result<Vec<String>> {
        let id = ResourceId::from_path(group, version, resource);
        let entry = self.flights.entry(&format!(
            "namespaces_{}_{}_{}",
            id.group, id.version, id.resource
        ));
        let _guard = entry.lock().await;

        let namespaced = self.catalog.lookup_namespaced(&id).await?;
        if !namespaced {
            return Ok(Vec::new());
        }
        self.strategy.get_namespaces(&id, namespaced).await
    }

    fn cache_stats(&self) -> CacheStats {
        self.strategy.cache_stats()
    }

    fn cache_status(&self) -> CacheStatus {
        let stats = self.strategy.cache_stats();
        CacheStatus {
            preload_complete: self.strategy.is_preload_complete(),
            ready_resources: self.strategy.ready_resources_count(),
            total_informers: stats.active_informers,
            total_objects: stats.total_objects,
            uptime: self.uptime(),
        }
    }

    fn performance_stats(&self) -> PerformanceStats {
        let stats = self.strategy.cache_stats();
        let synced: Vec<u64> = stats
            .resource_stats
            .values()
            .filter(|s| s.sync_duration_ms > 0)
            .map(|s| s.sync_duration_ms)
            .collect();
        let average_sync_ms = if synced.is_empty() {
            0
        } else {
            synced.iter().sum::<u64>() / synced.len() as u64
        };
        PerformanceStats {
            uptime: self.uptime(),
            average_sync_ms,
            total_sync_count: synced.len(),
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}
