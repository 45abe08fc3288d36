//! Discovery of served resource kinds and the TTL'd catalog cache.
//!
//! The reader walks the cluster's discovery endpoint (core versions plus
//! every API group's advertised versions) and emits one descriptor per
//! listable `(group, version, resource)`, filtered against the deprecation
//! and exclusion tables. The catalog cache memoises that output so the rest
//! of the system never hits discovery on a per-request path.

#![forbid(unsafe_code)]

mod catalog;
mod tables;

pub use catalog::{CatalogCache, CatalogSource, DEFAULT_CATALOG_TTL};
pub use tables::{is_deprecated, is_excluded};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::APIResource;
use klens_core::{Error, ResourceDescriptor, Result};
use kube::Client;
use tracing::{debug, warn};

/// One-shot producer of the canonical catalog of served resource kinds.
pub struct DiscoveryReader {
    client: Client,
}

impl DiscoveryReader {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Enumerate every listable resource kind the cluster serves.
    ///
    /// A group/version whose resource listing fails is logged and skipped so
    /// one broken aggregated API does not take the whole catalog down;
    /// failing to enumerate the group list itself fails the call. Output is
    /// sorted by `(group, name)`; the sort is stable, so within a group the
    /// advertised version order survives.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        let mut out = Vec::new();

        let core = self
            .client
            .list_core_api_versions()
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;
        for version in &core.versions {
            match self.client.list_core_api_resources(version).await {
                Ok(list) => collect(&mut out, "", version, &list.resources),
                Err(e) => {
                    warn!(version = %version, error = %e, "core version discovery failed; skipping")
                }
            }
        }

        let groups = self
            .client
            .list_api_groups()
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;
        for group in &groups.groups {
            for gv in &group.versions {
                match self.client.list_api_group_resources(&gv.group_version).await {
                    Ok(list) => collect(&mut out, &group.name, &gv.version, &list.resources),
                    Err(e) => {
                        warn!(group_version = %gv.group_version, error = %e, "group discovery failed; skipping")
                    }
                }
            }
        }

        out.sort_by(|a, b| a.group.cmp(&b.group).then_with(|| a.name.cmp(&b.name)));
        debug!(count = out.len(), "discovered api resources");
        Ok(out)
    }
}

#[async_trait::async_trait]
impl CatalogSource for DiscoveryReader {
    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        DiscoveryReader::list_resources(self).await
    }
}

fn collect(out: &mut Vec<ResourceDescriptor>, group: &str, version: &str, resources: &[APIResource]) {
    for r in resources {
        if keep(group, version, r) {
            out.push(ResourceDescriptor {
                group: group.to_string(),
                version: version.to_string(),
                name: r.name.clone(),
                kind: r.kind.clone(),
                namespaced: r.namespaced,
            });
        }
    }
}

/// Filters applied in order: subresources, verb support, the deprecation
/// table, the exclusion table.
fn keep(group: &str, version: &str, r: &APIResource) -> bool {
    if r.name.contains('/') {
        return false;
    }
    if !has_verb(r, "list") || !has_verb(r, "get") {
        return false;
    }
    if tables::is_deprecated(group, version, &r.name) {
        return false;
    }
    if tables::is_excluded(group, &r.name) {
        return false;
    }
    true
}

fn has_verb(r: &APIResource, verb: &str) -> bool {
    r.verbs.iter().any(|v| v == verb)
}
