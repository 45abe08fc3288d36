//! Short-TTL memoisation of discovery output.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use klens_core::{Error, ResourceDescriptor, ResourceId, Result};
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const DEFAULT_CATALOG_TTL: Duration = Duration::from_secs(5 * 60);

/// Anything that can produce the catalog; implemented by `DiscoveryReader`
/// and by stubs in tests.
#[async_trait::async_trait]
pub trait CatalogSource: Send + Sync {
    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>>;
}

struct CatalogEntry {
    descriptors: Arc<Vec<ResourceDescriptor>>,
    fetched_at: Instant,
}

/// TTL'd catalog over a [`CatalogSource`].
///
/// Readers get the cached sequence while it is fresh; the first caller past
/// the TTL refreshes under a single-flight mutex and swaps the whole entry
/// atomically. `namespaced` lookups are served from the cached sequence
/// only – discovery is never consulted on a per-request path.
pub struct CatalogCache {
    source: Box<dyn CatalogSource>,
    ttl: Duration,
    cached: ArcSwapOption<CatalogEntry>,
    refresh: Mutex<()>,
}

impl CatalogCache {
    pub fn new(source: impl CatalogSource + 'static) -> Self {
        Self::with_ttl(source, DEFAULT_CATALOG_TTL)
    }

    pub fn with_ttl(source: impl CatalogSource + 'static, ttl: Duration) -> Self {
        Self {
            source: Box::new(source),
            ttl,
            cached: ArcSwapOption::const_empty(),
            refresh: Mutex::new(()),
        }
    }

    /// The catalog, refreshed on TTL expiry.
    pub async fn get(&self) -> Result<Arc<Vec<ResourceDescriptor>>> {
        if let Some(descriptors) = self.fresh() {
            return Ok(descriptors);
        }
        let _flight = self.refresh.lock().await;
        // Another caller may have refreshed while we waited on the lock.
        if let Some(descriptors) = self.fresh() {
            debug!("catalog refreshed while waiting; reusing");
            return Ok(descriptors);
        }
        let descriptors = Arc::new(self.source.list_resources().await?);
        info!(count = descriptors.len(), "catalog refreshed");
        self.cached.store(Some(Arc::new(CatalogEntry {
            descriptors: descriptors.clone(),
            fetched_at: Instant::now(),
        })));
        Ok(descriptors)
    }

    /// Resolve whether a kind is namespaced without an upstream round-trip.
    pub async fn lookup_namespaced(&self, id: &ResourceId) -> Result<bool> {
        let catalog = self.get().await?;
        catalog
            .iter()
            .find(|d| d.group == id.group && d.version == id.version && d.name == id.resource)
            .map(|d| d.namespaced)
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    fn fresh(&self) -> Option<Arc<Vec<ResourceDescriptor>>> {
        let entry = self.cached.load();
        entry
            .as_ref()
            .filter(|e| e.fetched_at.elapsed() < self.ttl)
            .map(|e| e.descriptors.clone())
    }
}
