//! Scenario tests driving the fleet through scripted watch streams.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use klens_core::{Error, ResourceDescriptor, ResourceId};
use klens_fleet::{
    InformerManager, StrategyConfig, StrategyManager, WatchEvent, WatchProvider, WatchStream,
};
use kube::core::DynamicObject;
use kube::runtime::watcher::Event;
use serde_json::json;

fn obj(api_version: &str, kind: &str, name: &str, ns: Option<&str>) -> DynamicObject {
    let mut metadata = json!({ "name": name });
    if let Some(ns) = ns {
        metadata["namespace"] = json!(ns);
    }
    serde_json::from_value(json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": metadata,
    }))
    .expect("valid dynamic object")
}

fn widget(name: &str, ns: &str) -> DynamicObject {
    obj("some.example.com/v1", "Widget", name, Some(ns))
}

fn pod(name: &str, ns: &str) -> DynamicObject {
    obj("v1", "Pod", name, Some(ns))
}

/// Provider serving a fixed event script per identity; identities without a
/// script get a stream that never lists, so they never become ready.
fn scripted(scripts: HashMap<String, Vec<WatchEvent>>) -> WatchProvider {
    Arc::new(move |id: &ResourceId, _namespaced: bool| -> WatchStream {
        match scripts.get(&id.to_string()) {
            Some(events) => stream::iter(events.clone().into_iter().map(Ok))
                .chain(stream::pending())
                .boxed(),
            None => stream::pending().boxed(),
        }
    })
}

fn descriptor(group: &str, name: &str, kind: &str, namespaced: bool) -> ResourceDescriptor {
    ResourceDescriptor {
        group: group.to_string(),
        version: "v1".to_string(),
        name: name.to_string(),
        kind: kind.to_string(),
        namespaced,
    }
}

fn fast_config() -> StrategyConfig {
    StrategyConfig {
        query_sync_wait: Duration::from_millis(500),
        query_poll_interval: Duration::from_millis(10),
        idle_eviction: false,
        ..StrategyConfig::default()
    }
}

async fn wait_ready(manager: &InformerManager, id: &ResourceId) {
    for _ in 0..200 {
        if manager.is_ready(id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("informer for {id} never became ready");
}

#[tokio::test]
async fn preload_marks_core_kinds_ready() {
    let pods = ResourceId::new("", "v1", "pods");
    let deployments = ResourceId::new("apps", "v1", "deployments");
    let widgets = ResourceId::new("some.example.com", "v1", "widgets");

    let mut scripts = HashMap::new();
    scripts.insert(
        pods.to_string(),
        vec![Event::Restarted(vec![pod("p1", "default")])],
    );
    scripts.insert(
        deployments.to_string(),
        vec![Event::Restarted(vec![obj(
            "apps/v1",
            "Deployment",
            "d1",
            Some("default"),
        )])],
    );

    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    let config = StrategyConfig {
        core_rids: vec![pods.clone(), deployments.clone()],
        ..fast_config()
    };
    let strategy = StrategyManager::new(manager.clone(), config);

    let catalog = vec![
        descriptor("apps", "deployments", "Deployment", true),
        descriptor("", "pods", "Pod", true),
        descriptor("some.example.com", "widgets", "Widget", true),
    ];
    assert!(!strategy.is_preload_complete());
    strategy.preload(&catalog);
    strategy
        .wait_preload_complete(Duration::from_secs(1))
        .await
        .unwrap();
    assert!(strategy.is_preload_complete());

    wait_ready(&manager, &pods).await;
    wait_ready(&manager, &deployments).await;
    // the CRD was not in the core set, so nothing started it
    assert!(!manager.is_ready(&widgets));
    assert!(!manager.contains(&widgets));
}

#[tokio::test]
async fn lazy_start_serves_first_access() {
    let widgets = ResourceId::new("some.example.com", "v1", "widgets");
    let mut scripts = HashMap::new();
    scripts.insert(
        widgets.to_string(),
        vec![Event::Restarted(vec![widget("w1", "a"), widget("w2", "b")])],
    );

    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    let strategy = StrategyManager::new(manager.clone(), fast_config());

    assert!(!manager.contains(&widgets));
    let objects = strategy.get_objects(&widgets, "", true).await.unwrap();
    assert_eq!(objects.len(), 2);

    let namespaces = strategy.get_namespaces(&widgets, true).await.unwrap();
    assert_eq!(namespaces, vec!["a", "b"]);
}

#[tokio::test]
async fn namespace_filter_scopes_the_snapshot() {
    let pods = ResourceId::new("", "v1", "pods");
    let mut scripts = HashMap::new();
    scripts.insert(
        pods.to_string(),
        vec![Event::Restarted(vec![
            pod("web", "default"),
            pod("dns", "kube-system"),
            pod("proxy", "kube-system"),
        ])],
    );

    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    let strategy = StrategyManager::new(manager.clone(), fast_config());

    let all = strategy.get_objects(&pods, "", true).await.unwrap();
    assert_eq!(all.len(), 3);

    let system = strategy.get_objects(&pods, "kube-system", true).await.unwrap();
    assert_eq!(system.len(), 2);
    assert!(system
        .iter()
        .all(|o| o.pointer("/metadata/namespace").unwrap() == "kube-system"));

    let default = strategy.get_objects(&pods, "default", true).await.unwrap();
    assert_eq!(default.len() + system.len(), all.len());
}

#[tokio::test]
async fn watch_modify_replaces_in_place() {
    let widgets = ResourceId::new("some.example.com", "v1", "widgets");
    let mut rev2 = widget("w1", "a");
    rev2.data = json!({"spec": {"rev": 2}});

    let mut scripts = HashMap::new();
    scripts.insert(
        widgets.to_string(),
        vec![
            Event::Restarted(vec![widget("w1", "a")]),
            Event::Applied(rev2),
        ],
    );

    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    manager.start_informer(&widgets, true).unwrap();
    wait_ready(&manager, &widgets).await;

    // deltas apply in receipt order; poll until the replacement lands
    for _ in 0..200 {
        let objects = manager.get_objects(&widgets, "").unwrap();
        if objects.len() == 1 && objects[0].pointer("/spec/rev") == Some(&json!(2)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("modified object never replaced the stored one");
}

#[tokio::test]
async fn watch_add_and_delete_update_membership() {
    let widgets = ResourceId::new("some.example.com", "v1", "widgets");
    let mut scripts = HashMap::new();
    scripts.insert(
        widgets.to_string(),
        vec![
            Event::Restarted(vec![widget("w1", "a")]),
            Event::Applied(widget("w3", "a")),
            Event::Deleted(widget("w1", "a")),
        ],
    );

    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    manager.start_informer(&widgets, true).unwrap();
    wait_ready(&manager, &widgets).await;

    for _ in 0..200 {
        let objects = manager.get_objects(&widgets, "").unwrap();
        let names: Vec<&str> = objects
            .iter()
            .filter_map(|o| o.pointer("/metadata/name").and_then(|v| v.as_str()))
            .collect();
        if names == vec!["w3"] {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("store did not converge to the post-delta membership");
}

#[tokio::test]
async fn fallback_returns_loading_on_cold_cache() {
    let configmaps = ResourceId::new("", "v1", "configmaps");
    // no script: the stream never lists
    let manager = Arc::new(InformerManager::with_provider(scripted(HashMap::new())));
    let strategy = StrategyManager::new(manager.clone(), fast_config());

    let snapshot = strategy
        .get_objects_with_fallback(&configmaps, "", true)
        .await;
    assert!(snapshot.objects.is_empty());
    assert!(snapshot.loading);
    // the ensure side effect registered the reflector
    assert!(manager.contains(&configmaps));
}

#[tokio::test]
async fn fallback_serves_data_once_ready() {
    let pods = ResourceId::new("", "v1", "pods");
    let mut scripts = HashMap::new();
    scripts.insert(
        pods.to_string(),
        vec![Event::Restarted(vec![pod("web", "default")])],
    );
    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    let strategy = StrategyManager::new(manager.clone(), fast_config());

    manager.start_informer(&pods, true).unwrap();
    wait_ready(&manager, &pods).await;

    let snapshot = strategy.get_objects_with_fallback(&pods, "", true).await;
    assert!(!snapshot.loading);
    assert_eq!(snapshot.objects.len(), 1);
}

#[tokio::test]
async fn blocking_query_times_out_on_unready_kind() {
    let widgets = ResourceId::new("some.example.com", "v1", "widgets");
    let manager = Arc::new(InformerManager::with_provider(scripted(HashMap::new())));
    let strategy = StrategyManager::new(manager.clone(), fast_config());

    let err = strategy.get_objects(&widgets, "", true).await.unwrap_err();
    assert!(matches!(err, Error::NotReady(_)), "got {err:?}");
}

#[tokio::test]
async fn eviction_frees_a_slot_at_the_cap() {
    let first = ResourceId::new("example.com", "v1", "firsts");
    let second = ResourceId::new("example.com", "v1", "seconds");
    let third = ResourceId::new("example.com", "v1", "thirds");

    let mut scripts = HashMap::new();
    for id in [&first, &second, &third] {
        scripts.insert(id.to_string(), vec![Event::Restarted(vec![])]);
    }

    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    let config = StrategyConfig {
        core_rids: Vec::new(),
        max_concurrent_informers: 2,
        // everything counts as idle the moment it stops being touched
        idle_threshold: Duration::ZERO,
        ..fast_config()
    };
    let strategy = StrategyManager::new(manager.clone(), config);

    strategy.ensure_informer(&first, true).unwrap();
    strategy.ensure_informer(&second, true).unwrap();
    assert_eq!(manager.active_count(), 2);

    // let the access records age past the zero threshold
    tokio::time::sleep(Duration::from_millis(5)).await;
    strategy.ensure_informer(&third, true).unwrap();
    assert!(manager.contains(&third));
    assert!(manager.active_count() <= 2);
}

#[tokio::test]
async fn core_kinds_survive_eviction() {
    let pods = ResourceId::new("", "v1", "pods");
    let widgets = ResourceId::new("example.com", "v1", "widgets");

    let mut scripts = HashMap::new();
    scripts.insert(pods.to_string(), vec![Event::Restarted(vec![])]);
    scripts.insert(widgets.to_string(), vec![Event::Restarted(vec![])]);

    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    let config = StrategyConfig {
        core_rids: vec![pods.clone()],
        idle_threshold: Duration::ZERO,
        ..fast_config()
    };
    let strategy = StrategyManager::new(manager.clone(), config);

    strategy.ensure_informer(&pods, true).unwrap();
    strategy.ensure_informer(&widgets, true).unwrap();
    strategy.evict_idle();

    assert!(manager.contains(&pods));
    assert!(!manager.contains(&widgets));
}

#[tokio::test]
async fn retire_missing_stops_kinds_gone_from_catalog() {
    let widgets = ResourceId::new("example.com", "v1", "widgets");
    let mut scripts = HashMap::new();
    scripts.insert(widgets.to_string(), vec![Event::Restarted(vec![])]);

    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    let strategy = StrategyManager::new(manager.clone(), fast_config());
    strategy.ensure_informer(&widgets, true).unwrap();

    // still served: nothing happens
    strategy.retire_missing(&[descriptor("example.com", "widgets", "Widget", true)]);
    assert!(manager.contains(&widgets));

    // dropped from the catalog: the reflector goes with it
    strategy.retire_missing(&[descriptor("", "pods", "Pod", true)]);
    assert!(!manager.contains(&widgets));
}

#[tokio::test]
async fn readiness_is_monotone_until_stop() {
    let pods = ResourceId::new("", "v1", "pods");
    let mut scripts = HashMap::new();
    scripts.insert(
        pods.to_string(),
        vec![
            Event::Restarted(vec![pod("web", "default")]),
            // a relist must not clear readiness
            Event::Restarted(vec![pod("web", "default"), pod("dns", "kube-system")]),
        ],
    );

    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    manager.start_informer(&pods, true).unwrap();
    wait_ready(&manager, &pods).await;

    for _ in 0..20 {
        assert!(manager.is_ready(&pods));
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    manager.stop_informer(&pods);
    assert!(!manager.is_ready(&pods));
    assert!(matches!(
        manager.get_objects(&pods, "").unwrap_err(),
        Error::NotRegistered(_)
    ));
}

#[tokio::test]
async fn shutdown_clears_all_readiness() {
    let pods = ResourceId::new("", "v1", "pods");
    let widgets = ResourceId::new("example.com", "v1", "widgets");
    let mut scripts = HashMap::new();
    scripts.insert(pods.to_string(), vec![Event::Restarted(vec![])]);
    scripts.insert(widgets.to_string(), vec![Event::Restarted(vec![])]);

    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    manager.start_informer(&pods, true).unwrap();
    manager.start_informer(&widgets, true).unwrap();
    wait_ready(&manager, &pods).await;
    wait_ready(&manager, &widgets).await;

    manager.shutdown();
    assert!(!manager.is_ready(&pods));
    assert!(!manager.is_ready(&widgets));
    assert_eq!(manager.active_count(), 0);
    assert!(matches!(
        manager.start_informer(&pods, true).unwrap_err(),
        Error::ShuttingDown
    ));
}

#[tokio::test]
async fn stats_aggregate_ready_kinds() {
    let pods = ResourceId::new("", "v1", "pods");
    let widgets = ResourceId::new("example.com", "v1", "widgets");
    let mut scripts = HashMap::new();
    scripts.insert(
        pods.to_string(),
        vec![Event::Restarted(vec![
            pod("web", "default"),
            pod("dns", "kube-system"),
        ])],
    );
    // widgets never lists

    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    manager.start_informer(&pods, true).unwrap();
    manager.start_informer(&widgets, true).unwrap();
    wait_ready(&manager, &pods).await;
    manager
        .wait_for_all_sync(Duration::from_secs(2))
        .await
        .ok();

    let stats = manager.stats();
    assert_eq!(stats.active_informers, 2);
    assert_eq!(stats.total_objects, 2);
    assert_eq!(stats.sync_status.get("v1/pods"), Some(&true));
    assert_eq!(stats.sync_status.get("example.com/v1/widgets"), Some(&false));

    let pod_stat = stats.resource_stats.get("v1/pods").unwrap();
    assert!(pod_stat.is_ready);
    assert_eq!(pod_stat.object_count, 2);
    assert_eq!(pod_stat.namespace_count, 2);
}

#[tokio::test]
async fn start_informer_is_idempotent() {
    let pods = ResourceId::new("", "v1", "pods");
    let mut scripts = HashMap::new();
    scripts.insert(
        pods.to_string(),
        vec![Event::Restarted(vec![pod("web", "default")])],
    );

    let manager = Arc::new(InformerManager::with_provider(scripted(scripts)));
    manager.start_informer(&pods, true).unwrap();
    wait_ready(&manager, &pods).await;
    // double start must not reset the running reflector
    manager.start_informer(&pods, true).unwrap();
    assert!(manager.is_ready(&pods));
    assert_eq!(manager.active_count(), 1);
}
