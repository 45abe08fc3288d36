//! klens core types – resource identity, catalog descriptors, objects, errors.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Resource identity `(group, version, resource)` – the key of every map in
/// the fleet. `group` is empty for the core group; `resource` is the plural
/// lowercase URL segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ResourceId {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// Build an identity from URL path segments, mapping the `"core"` group
    /// sentinel to the empty group.
    pub fn from_path(group: &str, version: &str, resource: &str) -> Self {
        let group = if group == "core" { "" } else { group };
        Self::new(group, version, resource)
    }

    /// `apiVersion` form: `v1` for the core group, `group/version` otherwise.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// A served resource kind as discovered from the cluster: identity plus the
/// display kind and whether its objects carry a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    /// Plural resource name (the URL segment).
    pub name: String,
    pub kind: String,
    pub namespaced: bool,
}

impl ResourceDescriptor {
    pub fn id(&self) -> ResourceId {
        ResourceId::new(&self.group, &self.version, &self.name)
    }
}

/// Objects are opaque JSON documents; the fleet only inspects `metadata`.
pub type Object = serde_json::Value;

/// Key of an object within one resource kind: `(namespace, name)`, with an
/// empty namespace for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

pub fn object_name(obj: &Object) -> Option<&str> {
    obj.pointer("/metadata/name").and_then(|v| v.as_str())
}

pub fn object_namespace(obj: &Object) -> Option<&str> {
    obj.pointer("/metadata/namespace").and_then(|v| v.as_str())
}

/// Extract the store key; `None` for documents without `metadata.name`.
pub fn object_key(obj: &Object) -> Option<ObjectKey> {
    let name = object_name(obj)?.to_string();
    let namespace = object_namespace(obj).unwrap_or("").to_string();
    Some(ObjectKey { namespace, name })
}

/// Drop metadata fields that do not contribute to browsing (managed-fields
/// history, annotations) before an object enters a store.
pub fn trim_object(obj: &mut Object) {
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("annotations");
    }
}

/// Errors surfaced through the fleet and the query facade. Variants scoped to
/// a single kind carry its rendered identity.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum Error {
    #[error("informer for {0} not registered")]
    NotRegistered(String),
    #[error("informer for {0} not synced yet")]
    NotReady(String),
    #[error("resource {0} not found in catalog")]
    NotFound(String),
    #[error("discovery: {0}")]
    Discovery(String),
    #[error("shutting down")]
    ShuttingDown,
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
