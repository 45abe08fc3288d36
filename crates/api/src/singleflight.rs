//! Keyed request collapsing.
//!
//! Identical in-flight requests share one mutex so at most one of them does
//! the underlying work at a time. Entries are advisory and short-lived: the
//! map is rebuilt wholesale once it grows past a small threshold instead of
//! being evicted per entry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

const MAX_ENTRIES: usize = 100;

pub struct SingleFlight {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// The shared mutex for `key`; callers hold its guard for the duration
    /// of the underlying operation.
    pub fn entry(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.inner.lock().unwrap();
        if map.len() > MAX_ENTRIES {
            debug!(size = map.len(), "rebuilding single-flight map");
            map.clear();
        }
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl Default for SingleFlight {
    fn default() -> Self {
        Self::new()
    }
}
