//! The multi-resource informer fleet: per-kind reflectors over watch streams,
//! the registry that owns their lifecycles, and the policy layer (preload,
//! lazy start, bounded-wait queries, idle eviction) on top.

#![forbid(unsafe_code)]

mod manager;
mod reflector;
mod store;
mod strategy;

pub use manager::{CacheStats, InformerManager, ResourceStat};
pub use reflector::{kube_watch_provider, Reflector, WatchEvent, WatchProvider, WatchStream};
pub use store::ObjectStore;
pub use strategy::{FallbackSnapshot, StrategyConfig, StrategyManager};
