//! Per-kind reflector: one long-lived task consuming a watch stream into a
//! local store, with a monotone readiness flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use klens_core::{Object, ResourceId};
use kube::api::Api;
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::watcher::{self, Event};
use kube::Client;
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::ObjectStore;

pub type WatchEvent = Event<DynamicObject>;
pub type WatchStream = BoxStream<'static, Result<WatchEvent, watcher::Error>>;

/// Produces a fresh list-then-watch stream for a resource kind. The default
/// provider wraps `kube::runtime::watcher`; tests inject scripted streams.
pub type WatchProvider = Arc<dyn Fn(&ResourceId, bool) -> WatchStream + Send + Sync>;

const BACKOFF_MAX_SECS: u64 = 30;

/// Default provider: a cluster-wide dynamic watcher for the kind.
pub fn kube_watch_provider(client: Client) -> WatchProvider {
    Arc::new(move |id: &ResourceId, _namespaced: bool| {
        // The dynamic client builds list/watch URLs from group, version and
        // plural alone; kind is not consulted.
        let ar = ApiResource {
            group: id.group.clone(),
            version: id.version.clone(),
            api_version: id.api_version(),
            kind: String::new(),
            plural: id.resource.clone(),
        };
        let api: Api<DynamicObject> = Api::all_with(client.clone(), &ar);
        watcher::watcher(api, watcher::Config::default()).boxed()
    })
}

/// Handle to one running reflector. The watch loop runs as a spawned task;
/// the handle only carries the shared store, the readiness flag and the stop
/// signal.
pub struct Reflector {
    id: ResourceId,
    namespaced: bool,
    store: Arc<RwLock<ObjectStore>>,
    ready: Arc<AtomicBool>,
    stop: watch::Sender<bool>,
}

impl Reflector {
    pub(crate) fn new(id: ResourceId, namespaced: bool) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            id,
            namespaced,
            store: Arc::new(RwLock::new(ObjectStore::default())),
            ready: Arc::new(AtomicBool::new(false)),
            stop,
        }
    }

    /// Readiness is monotone within one lifetime: it flips to true once the
    /// initial list has been applied and never reverts until the reflector
    /// is stopped and dropped.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub(crate) fn ready_flag(&self) -> Arc<AtomicBool> {
        self.ready.clone()
    }

    /// Snapshot of the store, filtered by namespace; outbound objects are
    /// clones the caller owns.
    pub fn list(&self, namespace: &str) -> Vec<Object> {
        self.store.read().unwrap().list(namespace)
    }

    /// Sorted distinct non-empty namespaces in the store.
    pub fn namespaces(&self) -> Vec<String> {
        self.store.read().unwrap().namespaces()
    }

    pub fn object_count(&self) -> usize {
        self.store.read().unwrap().len()
    }

    /// Fire the stop signal; the watch loop exits cooperatively.
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    pub(crate) fn spawn(&self, provider: WatchProvider) -> JoinHandle<()> {
        let id = self.id.clone();
        let namespaced = self.namespaced;
        let store = self.store.clone();
        let ready = self.ready.clone();
        let stop_rx = self.stop.subscribe();
        tokio::spawn(run_watch_loop(id, namespaced, store, ready, stop_rx, provider))
    }
}

/// List-then-watch loop. `Restarted` carries the full listing (initial list
/// or relist) and replaces the store atomically; watch deltas upsert/remove
/// in receipt order. Stream errors recreate the stream under exponential
/// backoff; a stale cursor (`410 Gone`) is recovered by the relist the fresh
/// stream performs. Readiness flips on the first applied listing and is never
/// cleared by a relist.
async fn run_watch_loop(
    id: ResourceId,
    namespaced: bool,
    store: Arc<RwLock<ObjectStore>>,
    ready: Arc<AtomicBool>,
    mut stop_rx: watch::Receiver<bool>,
    provider: WatchProvider,
) {
    let mut backoff: u64 = 1;
    loop {
        if *stop_rx.borrow() {
            break;
        }
        let mut stream = provider(&id, namespaced);
        debug!(rid = %id, "watch stream opened");

        loop {
            tokio::select! {
                // Also resolves when the sender is dropped (registry removal).
                _ = stop_rx.changed() => {
                    info!(rid = %id, "reflector stopped");
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(Event::Restarted(items))) => {
                        let count = items.len();
                        let objects: Vec<Object> = items
                            .into_iter()
                            .filter_map(|o| serde_json::to_value(o).ok())
                            .collect();
                        store.write().unwrap().replace_all(objects);
                        if !ready.swap(true, Ordering::AcqRel) {
                            info!(rid = %id, count, "initial list applied");
                        } else {
                            debug!(rid = %id, count, "relist applied");
                            counter!("relist_total", 1u64);
                        }
                        backoff = 1;
                    }
                    Some(Ok(Event::Applied(obj))) => {
                        if let Ok(value) = serde_json::to_value(obj) {
                            store.write().unwrap().upsert(value);
                        }
                    }
                    Some(Ok(Event::Deleted(obj))) => {
                        if let Ok(value) = serde_json::to_value(obj) {
                            store.write().unwrap().remove(&value);
                        }
                    }
                    Some(Err(e)) => {
                        let msg = e.to_string();
                        counter!("watch_errors_total", 1u64);
                        if msg.contains("410") || msg.to_ascii_lowercase().contains("expired") {
                            warn!(rid = %id, error = %msg, "watch cursor stale; relisting");
                        } else {
                            warn!(rid = %id, error = %msg, "watch stream error; restarting");
                        }
                        break;
                    }
                    None => {
                        debug!(rid = %id, "watch stream ended");
                        break;
                    }
                }
            }
        }

        let delay = Duration::from_secs(backoff.min(BACKOFF_MAX_SECS));
        tokio::select! {
            _ = stop_rx.changed() => {
                info!(rid = %id, "reflector stopped");
                return;
            }
            _ = tokio::time::sleep(delay) => {}
        }
        backoff = (backoff * 2).clamp(1, BACKOFF_MAX_SECS);
        counter!("watch_restarts_total", 1u64);
    }
}
