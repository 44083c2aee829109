//! HTTP surface (spec.md §6): the data-plane proxy route plus the slice
//! of control-plane routes the core subsystems are exercised through
//! (SPEC_FULL.md §6). Routing follows the teacher's `axum` workspace
//! dependency; handlers are thin adapters over `ProxyEngine`/`Store`/
//! `TransparencyLog`/`Watermarker`, never containing pipeline logic
//! themselves.

mod control_plane;
mod data_plane;
mod state;

pub use state::AppState;

use axum::routing::{get, patch, post, put};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

pub fn router(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route(
            "/metrics",
            get(move || {
                let handle = metrics_handle.clone();
                async move { handle.render() }
            }),
        )
        .route("/register-api", post(control_plane::register_api))
        .route("/services/:id/keys", post(control_plane::create_api_key))
        .route(
            "/api-keys/:id/rate-limit",
            put(control_plane::set_rate_limit),
        )
        .route(
            "/services/:id/keys/:kid/revoke",
            patch(control_plane::revoke_api_key),
        )
        .route(
            "/services/:id/watermarking",
            post(control_plane::set_watermarking).get(control_plane::get_watermarking),
        )
        .route(
            "/services/:id/bot-blocking",
            put(control_plane::set_bot_blocking),
        )
        .route("/watermark/verify", post(control_plane::verify_watermark))
        .route(
            "/transparency/merkle-latest",
            get(control_plane::merkle_latest),
        )
        .route(
            "/transparency/merkle-history",
            get(control_plane::merkle_history),
        )
        .route(
            "/transparency/verify/:batch_id",
            get(control_plane::verify_batch),
        )
        .route(
            "/transparency/blockchain/:batch_id",
            get(control_plane::blockchain_status),
        )
        .route(
            "/proxy/:service_id",
            get(data_plane::proxy_root)
                .post(data_plane::proxy_root)
                .put(data_plane::proxy_root)
                .delete(data_plane::proxy_root),
        )
        .route(
            "/proxy/:service_id/*path",
            get(data_plane::proxy_with_path)
                .post(data_plane::proxy_with_path)
                .put(data_plane::proxy_with_path)
                .delete(data_plane::proxy_with_path),
        )
        .with_state(state)
}
