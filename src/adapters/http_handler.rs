//! HTTP surface of the gateway.
//!
//! `/health`, `/metrics` and `/status` are served without admission checks.
//! `/proxy/{*path}` runs behind [`require_admission`], so its handler only ever
//! executes while holding a slot. The proxy handler does not forward anything;
//! it reports what it would have forwarded along with the admission token.
use std::{sync::Arc, time::Instant};

use axum::{
    Extension, Json, Router,
    extract::{Path, Request, State},
    http::Method,
    middleware,
    routing::get,
};
use serde_json::{Value, json};
use tower_http::catch_panic::CatchPanicLayer;

use crate::{
    adapters::{
        error::{ApiError, handle_panic},
        middleware::{
            Admitted, RequestId, access_log_middleware, request_id_middleware, require_admission,
        },
    },
    config::models::ServerConfig,
    core::AdmissionController,
};

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub controller: AdmissionController,
    pub config: Arc<ServerConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(controller: AdmissionController, config: Arc<ServerConfig>) -> Self {
        Self {
            controller,
            config,
            started_at: Instant::now(),
        }
    }
}

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    let guarded = Router::new()
        .route(
            "/proxy/{*path}",
            get(proxy_request)
                .post(proxy_request)
                .put(proxy_request)
                .delete(proxy_request),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_admission,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .merge(guarded)
        .fallback(not_found)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            access_log_middleware,
        ))
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn metrics(State(state): State<AppState>) -> Json<crate::core::MetricsSnapshot> {
    Json(state.controller.metrics_snapshot())
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let controller = &state.controller;
    Json(json!({
        "service": "turnstile",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "admission": {
            "max_concurrent": controller.max_concurrent(),
            "acquire_timeout_secs": controller.default_timeout().as_secs_f64(),
            "closed": controller.is_closed(),
        },
        "metrics": controller.metrics_snapshot(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn proxy_request(
    Path(path): Path<String>,
    method: Method,
    Extension(admitted): Extension<Admitted>,
) -> Json<Value> {
    Json(json!({
        "status": "proxied",
        "path": path,
        "method": method.as_str(),
        "request_id": admitted.request_id,
        "connection_id": admitted.token,
    }))
}

async fn not_found(req: Request) -> ApiError {
    ApiError::NotFound {
        request_id: req.extensions().get::<RequestId>().map(|id| id.0.clone()),
    }
}
