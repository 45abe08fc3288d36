//! Policy layer over the informer registry: preload of a pinned core set,
//! lazy start on first access, bounded-wait queries, a non-blocking fallback
//! path and idle eviction.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use klens_core::{Error, Object, ResourceDescriptor, ResourceId, Result};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use crate::manager::{CacheStats, InformerManager};

/// Fleet policy knobs.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    /// Pinned identities: preloaded at startup, never idle-evicted.
    pub core_rids: Vec<ResourceId>,
    /// Whether non-core kinds start on first access.
    pub lazy_start: bool,
    /// Whether non-core kinds are stopped when idle.
    pub idle_eviction: bool,
    pub eviction_scan_interval: Duration,
    pub idle_threshold: Duration,
    /// Soft cap on simultaneous reflectors; reaching it triggers an
    /// immediate eviction pass before the next start.
    pub max_concurrent_informers: usize,
    pub parallel_preload_fanout: usize,
    /// Longest a query will wait for a kind to become ready.
    pub query_sync_wait: Duration,
    pub query_poll_interval: Duration,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            core_rids: vec![
                ResourceId::new("", "v1", "pods"),
                ResourceId::new("", "v1", "services"),
                ResourceId::new("", "v1", "configmaps"),
                ResourceId::new("", "v1", "secrets"),
                ResourceId::new("", "v1", "namespaces"),
                ResourceId::new("apps", "v1", "deployments"),
                ResourceId::new("apps", "v1", "daemonsets"),
                ResourceId::new("apps", "v1", "statefulsets"),
            ],
            lazy_start: true,
            idle_eviction: true,
            eviction_scan_interval: Duration::from_secs(5 * 60),
            idle_threshold: Duration::from_secs(3 * 60),
            max_concurrent_informers: 50,
            parallel_preload_fanout: 5,
            query_sync_wait: Duration::from_secs(20),
            query_poll_interval: Duration::from_millis(50),
        }
    }
}

/// Result of the non-blocking query path: whatever the store holds right now
/// plus a marker telling the caller a sync is still in flight.
#[derive(Debug, Clone)]
pub struct FallbackSnapshot {
    pub objects: Vec<Object>,
    pub loading: bool,
}

/// Drives the informer registry according to a [`StrategyConfig`].
pub struct StrategyManager {
    manager: Arc<InformerManager>,
    config: StrategyConfig,
    access: Arc<RwLock<FxHashMap<ResourceId, Instant>>>,
    preload_done: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
}

impl StrategyManager {
    pub fn new(manager: Arc<InformerManager>, config: StrategyConfig) -> Self {
        let (preload_done, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);
        let access: Arc<RwLock<FxHashMap<ResourceId, Instant>>> =
            Arc::new(RwLock::new(FxHashMap::default()));

        if config.idle_eviction {
            tokio::spawn(eviction_sweep(
                manager.clone(),
                access.clone(),
                config.core_rids.clone(),
                config.eviction_scan_interval,
                config.idle_threshold,
                shutdown.subscribe(),
            ));
        }

        Self {
            manager,
            config,
            access,
            preload_done,
            shutdown,
        }
    }

    /// Start the pinned core kinds present in `catalog` in parallel, bounded
    /// by the preload fanout. Returns immediately; the preload-complete
    /// signal fires once every start has returned, failures included.
    pub fn preload(&self, catalog: &[ResourceDescriptor]) {
        let targets = preload_targets(&self.config.core_rids, catalog);
        if targets.is_empty() {
            info!("no resources to preload");
            let _ = self.preload_done.send(true);
            return;
        }
        info!(count = targets.len(), "starting parallel resource preload");

        let semaphore = Arc::new(Semaphore::new(self.config.parallel_preload_fanout));
        let mut handles = Vec::with_capacity(targets.len());
        for (id, namespaced) in targets {
            let semaphore = semaphore.clone();
            let manager = self.manager.clone();
            let access = self.access.clone();
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return 1usize;
                };
                info!(rid = %id, "preloading resource");
                match manager.start_informer(&id, namespaced) {
                    Ok(()) => {
                        touch(&access, &id);
                        0
                    }
                    Err(e) => {
                        error!(rid = %id, error = %e, "failed to preload resource");
                        1
                    }
                }
            }));
        }

        let preload_done = self.preload_done.clone();
        tokio::spawn(async move {
            let mut failures = 0usize;
            for handle in handles {
                failures += handle.await.unwrap_or(1);
            }
            if failures > 0 {
                error!(failures, "resource preload completed with errors");
            } else {
                info!("resource preload completed");
            }
            let _ = preload_done.send(true);
        });
    }

    pub fn is_preload_complete(&self) -> bool {
        *self.preload_done.borrow()
    }

    pub async fn wait_preload_complete(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.preload_done.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|done| *done))
            .await
            .map_err(|_| {
                Error::Internal(format!(
                    "timeout waiting for preload completion after {timeout:?}"
                ))
            })?
            .map_err(|_| Error::ShuttingDown)?;
        Ok(())
    }

    /// Idempotent "start if absent, note the access" operation. Reaching the
    /// reflector cap runs an immediate eviction pass to reclaim slots first.
    pub fn ensure_informer(&self, id: &ResourceId, namespaced: bool) -> Result<()> {
        if self.manager.is_ready(id) {
            touch(&self.access, id);
            return Ok(());
        }

        if !self.manager.contains(id) && !self.config.lazy_start && !self.is_core(id) {
            return Err(Error::NotRegistered(id.to_string()));
        }

        if self.manager.active_count() >= self.config.max_concurrent_informers {
            warn!(
                limit = self.config.max_concurrent_informers,
                "reached max concurrent informers; evicting idle ones"
            );
            self.evict_idle();
        }

        debug!(rid = %id, "lazy starting informer");
        self.manager.start_informer(id, namespaced)?;
        touch(&self.access, id);
        Ok(())
    }

    /// Blocking query: ensure the reflector, then poll readiness up to the
    /// configured wait before reading the store.
    pub async fn get_objects(
        &self,
        id: &ResourceId,
        namespace: &str,
        namespaced: bool,
    ) -> Result<Vec<Object>> {
        self.ensure_informer(id, namespaced)?;
        self.await_ready(id).await?;
        self.manager.get_objects(id, namespace)
    }

    /// Blocking query for the distinct namespaces of a kind.
    pub async fn get_namespaces(&self, id: &ResourceId, namespaced: bool) -> Result<Vec<String>> {
        self.ensure_informer(id, namespaced)?;
        self.await_ready(id).await?;
        self.manager.get_namespaces(id)
    }

    /// Non-blocking query: data if the kind is ready, otherwise kick off the
    /// reflector and hand back an empty snapshot flagged `loading` so the
    /// caller can render a placeholder and retry. Never waits beyond the
    /// ensure call.
    pub async fn get_objects_with_fallback(
        &self,
        id: &ResourceId,
        namespace: &str,
        namespaced: bool,
    ) -> FallbackSnapshot {
        if self.manager.is_ready(id) {
            touch(&self.access, id);
            if let Ok(objects) = self.manager.get_objects(id, namespace) {
                return FallbackSnapshot {
                    objects,
                    loading: false,
                };
            }
        }
        if let Err(e) = self.ensure_informer(id, namespaced) {
            warn!(rid = %id, error = %e, "failed to ensure informer for fallback query");
        }
        FallbackSnapshot {
            objects: Vec::new(),
            loading: !self.manager.is_ready(id),
        }
    }

    async fn await_ready(&self, id: &ResourceId) -> Result<()> {
        let deadline = Instant::now() + self.config.query_sync_wait;
        loop {
            if self.manager.is_ready(id) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::NotReady(id.to_string()));
            }
            tokio::time::sleep(self.config.query_poll_interval).await;
        }
    }

    /// Stop every non-core kind idle past the threshold and drop its access
    /// record.
    pub fn evict_idle(&self) {
        let candidates = {
            let access = self.access.read().unwrap();
            idle_candidates(
                &access,
                &self.config.core_rids,
                Instant::now(),
                self.config.idle_threshold,
            )
        };
        if candidates.is_empty() {
            return;
        }
        info!(count = candidates.len(), "evicting idle informers");
        for id in candidates {
            debug!(rid = %id, "evicting idle informer");
            self.manager.stop_informer(&id);
            self.access
                .write()
                .unwrap()
                .remove(&id);
            counter!("informer_evictions_total", 1u64);
        }
    }

    /// Stop reflectors whose identity is no longer served by the cluster.
    pub fn retire_missing(&self, catalog: &[ResourceDescriptor]) {
        let serving: HashSet<ResourceId> = catalog.iter().map(|d| d.id()).collect();
        for id in self.manager.registered_ids() {
            if !serving.contains(&id) {
                info!(rid = %id, "retiring informer for kind gone from catalog");
                self.manager.stop_informer(&id);
                self.access
                    .write()
                    .unwrap()
                    .remove(&id);
            }
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.manager.stats()
    }

    pub fn ready_resources_count(&self) -> usize {
        self.manager
            .stats()
            .sync_status
            .values()
            .filter(|ready| **ready)
            .count()
    }

    fn is_core(&self, id: &ResourceId) -> bool {
        self.config.core_rids.contains(id)
    }

    /// Stop the sweep task and the whole fleet beneath.
    pub fn shutdown(&self) {
        info!("shutting down strategy manager");
        let _ = self.shutdown.send(true);
        self.manager.shutdown();
    }
}

fn touch(access: &Arc<RwLock<FxHashMap<ResourceId, Instant>>>, id: &ResourceId) {
    access
        .write()
        .unwrap()
        .insert(id.clone(), Instant::now());
}

/// Intersect the pinned core set with the catalog so each start carries the
/// right `namespaced` flag; core kinds the cluster does not serve are
/// skipped.
fn preload_targets(
    core: &[ResourceId],
    catalog: &[ResourceDescriptor],
) -> Vec<(ResourceId, bool)> {
    let mut scope = FxHashMap::default();
    for descriptor in catalog {
        scope.insert(descriptor.id(), descriptor.namespaced);
    }
    core.iter()
        .filter_map(|id| scope.get(id).map(|namespaced| (id.clone(), *namespaced)))
        .collect()
}

/// Non-core identities whose last access is older than the threshold.
fn idle_candidates(
    access: &FxHashMap<ResourceId, Instant>,
    core: &[ResourceId],
    now: Instant,
    threshold: Duration,
) -> Vec<ResourceId> {
    access
        .iter()
        .filter(|(id, _)| !core.contains(id))
        .filter(|(_, last)| now.duration_since(**last) > threshold)
        .map(|(id, _)| id.clone())
        .collect()
}

async fn eviction_sweep(
    manager: Arc<InformerManager>,
    access: Arc<RwLock<FxHashMap<ResourceId, Instant>>>,
    core: Vec<ResourceId>,
    interval: Duration,
    threshold: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!("eviction sweep stopped");
                return;
            }
            _ = ticker.tick() => {
                let candidates = {
                    let access = access.read().unwrap();
                    idle_candidates(&access, &core, Instant::now(), threshold)
                };
                for id in candidates {
                    info!(rid = %id, "evicting idle informer");
                    manager.stop_informer(&id);
                    access.write().unwrap().remove(&id);
                    counter!("informer_evictions_total", 1u64);
                }
            }
        }
    }
}
