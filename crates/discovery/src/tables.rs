//! Filter tables for catalog construction.
//!
//! These are data, not logic: they track the upstream release cadence and are
//! kept apart from the filtering code that consults them.

/// Legacy beta group/versions superseded by stable ones. Listing them only
/// produces duplicate rows and deprecation warnings from the API server.
static DEPRECATED: &[(&str, &str, &[&str])] = &[
    ("batch", "v1beta1", &["cronjobs"]),
    (
        "extensions",
        "v1beta1",
        &[
            "deployments",
            "replicasets",
            "daemonsets",
            "ingresses",
            "podsecuritypolicies",
        ],
    ),
    (
        "apps",
        "v1beta1",
        &["deployments", "replicasets", "daemonsets", "statefulsets"],
    ),
    (
        "apps",
        "v1beta2",
        &["deployments", "replicasets", "daemonsets", "statefulsets"],
    ),
    ("networking.k8s.io", "v1beta1", &["ingresses"]),
    ("policy", "v1beta1", &["podsecuritypolicies"]),
    ("apiregistration.k8s.io", "v1beta1", &["apiservices"]),
    (
        "admissionregistration.k8s.io",
        "v1beta1",
        &[
            "mutatingwebhookconfigurations",
            "validatingwebhookconfigurations",
        ],
    ),
    ("scheduling.k8s.io", "v1beta1", &["priorityclasses"]),
    (
        "storage.k8s.io",
        "v1beta1",
        &["storageclasses", "volumeattachments"],
    ),
    (
        "rbac.authorization.k8s.io",
        "v1beta1",
        &["roles", "rolebindings", "clusterroles", "clusterrolebindings"],
    ),
];

/// Pseudo-resources that advertise `list` but are not browsable state:
/// review-style request objects, the metrics shadow entries for pods/nodes,
/// and the events duplicate served under `events.k8s.io`.
static EXCLUDED: &[(&str, &[&str])] = &[
    ("", &["componentstatuses", "bindings"]),
    (
        "authorization.k8s.io",
        &[
            "selfsubjectrulesreviews",
            "subjectaccessreviews",
            "localsubjectaccessreviews",
            "selfsubjectaccessreviews",
        ],
    ),
    ("authentication.k8s.io", &["tokenreviews"]),
    ("metrics.k8s.io", &["pods", "nodes"]),
    ("events.k8s.io", &["events"]),
];

pub fn is_deprecated(group: &str, version: &str, resource: &str) -> bool {
    DEPRECATED
        .iter()
        .any(|(g, v, rs)| *g == group && *v == version && rs.contains(&resource))
}

pub fn is_excluded(group: &str, resource: &str) -> bool {
    EXCLUDED
        .iter()
        .any(|(g, rs)| *g == group && rs.contains(&resource))
}
