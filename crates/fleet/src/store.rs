//! Per-kind indexed object store.

use std::collections::BTreeSet;

use klens_core::{object_key, object_namespace, trim_object, Object, ObjectKey};
use rustc_hash::FxHashMap;

/// Namespace filter sentinel meaning "every namespace".
const ALL_NAMESPACES: &str = "all";

/// Indexed set of objects for one resource kind, keyed by `(namespace, name)`.
/// Objects are trimmed on the way in; readers receive clones, never
/// references into the map.
#[derive(Debug, Default)]
pub struct ObjectStore {
    objects: FxHashMap<ObjectKey, Object>,
}

impl ObjectStore {
    /// Insert or replace by key. Documents without `metadata.name` are
    /// dropped; the upstream never produces them for real kinds.
    pub fn upsert(&mut self, mut obj: Object) {
        trim_object(&mut obj);
        if let Some(key) = object_key(&obj) {
            self.objects.insert(key, obj);
        }
    }

    pub fn remove(&mut self, obj: &Object) {
        if let Some(key) = object_key(obj) {
            self.objects.remove(&key);
        }
    }

    /// Replace the whole store with a fresh listing in one step, so readers
    /// observe either the previous snapshot or the new one.
    pub fn replace_all(&mut self, items: Vec<Object>) {
        let mut next = FxHashMap::with_capacity_and_hasher(items.len(), Default::default());
        for mut obj in items {
            trim_object(&mut obj);
            if let Some(key) = object_key(&obj) {
                next.insert(key, obj);
            }
        }
        self.objects = next;
    }

    /// Clone out every object, or only those in `namespace` when the filter
    /// is neither empty nor the `"all"` sentinel.
    pub fn list(&self, namespace: &str) -> Vec<Object> {
        if namespace.is_empty() || namespace == ALL_NAMESPACES {
            return self.objects.values().cloned().collect();
        }
        self.objects
            .values()
            .filter(|obj| object_namespace(obj) == Some(namespace))
            .cloned()
            .collect()
    }

    /// Sorted distinct non-empty namespaces currently represented.
    pub fn namespaces(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self
            .objects
            .keys()
            .filter(|k| !k.namespace.is_empty())
            .map(|k| k.namespace.as_str())
            .collect();
        set.into_iter().map(String::from).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
