//! HTTP/JSON surface over the in-process facade.

use std::sync::Arc;

use axum::extract::{Extension, Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use klens_api::{Browser, KlensApi};
use klens_core::Error;
use serde::Deserialize;
use serde_json::json;

pub fn router(browser: Arc<Browser>) -> Router {
    Router::new()
        .route("/api/resources", get(list_catalog))
        .route(
            "/api/resources/:group/:version/:resource/objects",
            get(list_objects),
        )
        .route(
            "/api/resources/:group/:version/:resource/objects/fast",
            get(list_objects_fast),
        )
        .route(
            "/api/resources/:group/:version/:resource/namespaces",
            get(list_namespaces),
        )
        .route("/api/cache/stats", get(cache_stats))
        .route("/api/cache/status", get(cache_status))
        .route("/api/performance/stats", get(performance_stats))
        .route("/healthz", get(health))
        .route("/livez", get(liveness))
        .route("/readyz", get(readiness))
        .layer(Extension(browser))
}

#[derive(Debug, Deserialize)]
struct NamespaceQuery {
    #[serde(default)]
    namespace: String,
}

async fn list_catalog(Extension(browser): Extension<Arc<Browser>>) -> Response {
    match browser.catalog().await {
        Ok(catalog) => Json(catalog).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_objects(
    Extension(browser): Extension<Arc<Browser>>,
    Path((group, version, resource)): Path<(String, String, String)>,
    Query(query): Query<NamespaceQuery>,
) -> Response {
    match browser
        .objects(&group, &version, &resource, &query.namespace)
        .await
    {
        Ok(objects) => Json(objects).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_objects_fast(
    Extension(browser): Extension<Arc<Browser>>,
    Path((group, version, resource)): Path<(String, String, String)>,
    Query(query): Query<NamespaceQuery>,
) -> Response {
    match browser
        .objects_fast(&group, &version, &resource, &query.namespace)
        .await
    {
        Ok(fast) => Json(fast).into_response(),
        Err(e) => error_response(e),
    }
}

async fn list_namespaces(
    Extension(browser): Extension<Arc<Browser>>,
    Path((group, version, resource)): Path<(String, String, String)>,
) -> Response {
    match browser.namespaces_for(&group, &version, &resource).await {
        Ok(namespaces) => Json(namespaces).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cache_stats(Extension(browser): Extension<Arc<Browser>>) -> Response {
    Json(browser.cache_stats()).into_response()
}

async fn cache_status(Extension(browser): Extension<Arc<Browser>>) -> Response {
    Json(browser.cache_status()).into_response()
}

async fn performance_stats(Extension(browser): Extension<Arc<Browser>>) -> Response {
    Json(browser.performance_stats()).into_response()
}

async fn health() -> Response {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "service": "klens",
    }))
    .into_response()
}

async fn liveness() -> Response {
    Json(json!({
        "status": "alive",
        "timestamp": Utc::now().to_rfc3339(),
        "service": "klens",
    }))
    .into_response()
}

async fn readiness(Extension(browser): Extension<Arc<Browser>>) -> Response {
    if !browser.is_ready() {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not ready",
                "message": "preload has not completed yet",
            })),
        )
            .into_response();
    }
    Json(json!({
        "status": "ready",
        "timestamp": Utc::now().to_rfc3339(),
        "service": "klens",
    }))
    .into_response()
}

fn error_response(err: Error) -> Response {
    let status = match err {
        Error::NotFound(_) | Error::NotRegistered(_) => StatusCode::NOT_FOUND,
        Error::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
