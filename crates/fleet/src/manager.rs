//! Thread-safe registry and facade over the per-kind reflectors.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use klens_core::{Error, Object, ResourceId, Result};
use kube::Client;
use metrics::histogram;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::reflector::{kube_watch_provider, Reflector, WatchProvider};

/// How long a reflector gets to finish its initial list before the failure is
/// recorded; the watch loop keeps retrying past this deadline.
const INITIAL_SYNC_TIMEOUT: Duration = Duration::from_secs(60);
const SYNC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Aggregated fleet statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub active_informers: usize,
    pub total_objects: usize,
    pub resource_stats: HashMap<String, ResourceStat>,
    pub last_update: DateTime<Utc>,
    pub sync_status: HashMap<String, bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStat {
    pub object_count: usize,
    pub namespace_count: usize,
    pub last_sync: Option<DateTime<Utc>>,
    pub sync_duration_ms: u64,
    pub is_ready: bool,
}

#[derive(Debug, Clone)]
struct SyncRecord {
    last_sync: DateTime<Utc>,
    duration: Duration,
}

/// Counts initial syncs still in flight so `wait_for_all_sync` has something
/// to block on.
struct SyncGate {
    pending: AtomicUsize,
    notify: Notify,
}

impl SyncGate {
    fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    fn add(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            // Register with the notify list before reading the counter, so a
            // done() landing between the read and the await still wakes us.
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct ReflectorEntry {
    reflector: Arc<Reflector>,
    _task: JoinHandle<()>,
}

/// Registry of reflectors keyed by resource identity. Owns their lifecycles,
/// exposes readiness, aggregates statistics and serves object and namespace
/// queries out of each reflector's store.
pub struct InformerManager {
    provider: WatchProvider,
    reflectors: RwLock<FxHashMap<ResourceId, ReflectorEntry>>,
    ready_flags: RwLock<FxHashMap<ResourceId, Arc<AtomicBool>>>,
    sync_records: Arc<RwLock<FxHashMap<ResourceId, SyncRecord>>>,
    pending_syncs: Arc<SyncGate>,
    shutdown: AtomicBool,
}

impl InformerManager {
    pub fn new(client: Client) -> Self {
        Self::with_provider(kube_watch_provider(client))
    }

    /// Build over a custom watch provider; the seam scenario tests inject
    /// scripted streams through.
    pub fn with_provider(provider: WatchProvider) -> Self {
        Self {
            provider,
            reflectors: RwLock::new(FxHashMap::default()),
            ready_flags: RwLock::new(FxHashMap::default()),
            sync_records: Arc::new(RwLock::new(FxHashMap::default())),
            pending_syncs: Arc::new(SyncGate::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Start a reflector for `id`. Idempotent: registering an identity that
    /// is already present is a no-op.
    pub fn start_informer(&self, id: &ResourceId, namespaced: bool) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let mut reflectors = self.reflectors.write().unwrap();
        if reflectors.contains_key(id) {
            debug!(rid = %id, "informer already running");
            return Ok(());
        }
        info!(rid = %id, "starting informer");

        let reflector = Arc::new(Reflector::new(id.clone(), namespaced));
        let ready = reflector.ready_flag();
        self.ready_flags
            .write()
            .unwrap()
            .insert(id.clone(), ready.clone());

        let task = reflector.spawn(self.provider.clone());
        reflectors.insert(
            id.clone(),
            ReflectorEntry {
                reflector,
                _task: task,
            },
        );
        drop(reflectors);

        self.pending_syncs.add();
        tokio::spawn(sync_watchdog(
            id.clone(),
            ready,
            self.sync_records.clone(),
            self.pending_syncs.clone(),
        ));
        Ok(())
    }

    /// Stop a reflector and forget it: registry entry, readiness flag and
    /// stats row all go.
    pub fn stop_informer(&self, id: &ResourceId) {
        let removed = self
            .reflectors
            .write()
            .unwrap()
            .remove(id);
        if let Some(entry) = removed {
            entry.reflector.stop();
            self.ready_flags
                .write()
                .unwrap()
                .remove(id);
            self.sync_records
                .write()
                .unwrap()
                .remove(id);
            info!(rid = %id, "stopped informer");
        }
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.reflectors
            .read()
            .unwrap()
            .contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.reflectors.read().unwrap().len()
    }

    pub fn registered_ids(&self) -> Vec<ResourceId> {
        self.reflectors
            .read()
            .unwrap()
            .keys()
            .cloned()
            .collect()
    }

    /// Lock-free readiness check; false for unknown identities.
    pub fn is_ready(&self, id: &ResourceId) -> bool {
        self.ready_flags
            .read()
            .unwrap()
            .get(id)
            .map(|flag| flag.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Caller-owned snapshot of the kind's objects, optionally filtered by
    /// namespace.
    pub fn get_objects(&self, id: &ResourceId, namespace: &str) -> Result<Vec<Object>> {
        let reflector = self.reflector(id)?;
        if !reflector.is_ready() {
            return Err(Error::NotReady(id.to_string()));
        }
        let objects = reflector.list(namespace);
        debug!(rid = %id, namespace = %namespace, count = objects.len(), "served objects");
        Ok(objects)
    }

    /// Sorted distinct namespaces currently holding objects of the kind.
    pub fn get_namespaces(&self, id: &ResourceId) -> Result<Vec<String>> {
        let reflector = self.reflector(id)?;
        if !reflector.is_ready() {
            return Err(Error::NotReady(id.to_string()));
        }
        Ok(reflector.namespaces())
    }

    fn reflector(&self, id: &ResourceId) -> Result<Arc<Reflector>> {
        self.reflectors
            .read()
            .unwrap()
            .get(id)
            .map(|entry| entry.reflector.clone())
            .ok_or_else(|| Error::NotRegistered(id.to_string()))
    }

    /// Aggregate statistics across the fleet. Object counts only include
    /// kinds that have completed their initial list.
    pub fn stats(&self) -> CacheStats {
        let records = self
            .sync_records
            .read()
            .unwrap()
            .clone();
        let reflectors = self.reflectors.read().unwrap();

        let mut resource_stats = HashMap::with_capacity(reflectors.len());
        let mut sync_status = HashMap::with_capacity(reflectors.len());
        let mut total_objects = 0;
        for (id, entry) in reflectors.iter() {
            let is_ready = entry.reflector.is_ready();
            sync_status.insert(id.to_string(), is_ready);

            let (object_count, namespace_count) = if is_ready {
                let count = entry.reflector.object_count();
                total_objects += count;
                (count, entry.reflector.namespaces().len())
            } else {
                (0, 0)
            };
            let record = records.get(id);
            resource_stats.insert(
                id.to_string(),
                ResourceStat {
                    object_count,
                    namespace_count,
                    last_sync: record.map(|r| r.last_sync),
                    sync_duration_ms: record.map(|r| r.duration.as_millis() as u64).unwrap_or(0),
                    is_ready,
                },
            );
        }

        CacheStats {
            active_informers: reflectors.len(),
            total_objects,
            resource_stats,
            last_update: Utc::now(),
            sync_status,
        }
    }

    /// Block until every reflector registered so far has finished its initial
    /// sync attempt (readiness or its own deadline).
    pub async fn wait_for_all_sync(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.pending_syncs.wait_idle()).await {
            Ok(()) => {
                info!("all informers completed initial sync");
                Ok(())
            }
            Err(_) => Err(Error::Internal(format!(
                "timeout waiting for initial sync after {timeout:?}"
            ))),
        }
    }

    /// Stop every reflector and invalidate the registry; subsequent starts
    /// fail with `ShuttingDown`.
    pub fn shutdown(&self) {
        info!("shutting down informer manager");
        self.shutdown.store(true, Ordering::Release);
        let entries: Vec<(ResourceId, ReflectorEntry)> = self
            .reflectors
            .write()
            .unwrap()
            .drain()
            .collect();
        for (id, entry) in entries {
            entry.reflector.stop();
            debug!(rid = %id, "stopped informer");
        }
        self.ready_flags.write().unwrap().clear();
        self.sync_records
            .write()
            .unwrap()
            .clear();
    }
}

/// Companion task per start: watches the readiness flag up to the sync
/// deadline and records the outcome. The reflector's own loop keeps retrying
/// either way.
async fn sync_watchdog(
    id: ResourceId,
    ready: Arc<AtomicBool>,
    records: Arc<RwLock<FxHashMap<ResourceId, SyncRecord>>>,
    gate: Arc<SyncGate>,
) {
    let start = Instant::now();
    let synced = loop {
        if ready.load(Ordering::Acquire) {
            break true;
        }
        if start.elapsed() >= INITIAL_SYNC_TIMEOUT {
            break false;
        }
        tokio::time::sleep(SYNC_POLL_INTERVAL).await;
    };

    let elapsed = start.elapsed();
    if synced {
        info!(rid = %id, took_ms = elapsed.as_millis() as u64, "cache synced");
        histogram!("sync_duration_ms", elapsed.as_millis() as f64);
    } else {
        error!(rid = %id, waited = ?elapsed, "timeout waiting for cache sync");
    }
    records.write().unwrap().insert(
        id,
        SyncRecord {
            last_sync: Utc::now(),
            duration: elapsed,
        },
    );
    gate.done();
}
