//! The data-plane route: `{GET,POST,PUT,DELETE} /proxy/{service_id}[/{path...}]`
//! (spec.md §6). Two route patterns are registered against two thin
//! wrappers over one shared core, since axum's wildcard segment only
//! matches a non-empty remainder.

use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, Method};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use gateway_util::ApiError;

use crate::ids::ServiceId;
use crate::proxy::ProxyRequest;

use super::AppState;

const API_KEY_HEADER: &str = "x-api-key";

/// `/proxy/:service_id` — no path suffix.
pub async fn proxy_root(
    state: State<Arc<AppState>>,
    Path(service_id): Path<i64>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state.0, ServiceId(service_id), String::new(), method, query, headers, body).await
}

/// `/proxy/:service_id/*path` — forwards everything after the service id.
pub async fn proxy_with_path(
    state: State<Arc<AppState>>,
    Path((service_id, path_suffix)): Path<(i64, String)>,
    method: Method,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    handle(state.0, ServiceId(service_id), path_suffix, method, query, headers, body).await
}

async fn handle(
    state: Arc<AppState>,
    service_id: ServiceId,
    path_suffix: String,
    method: Method,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let api_key_secret = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let req = ProxyRequest {
        service_id,
        method,
        path_suffix,
        query,
        headers,
        body,
        api_key_secret,
    };

    match state.proxy_engine.handle(req).await {
        Ok(resp) => {
            let mut builder = Response::builder().status(resp.status);
            if let Some(header_map) = builder.headers_mut() {
                *header_map = resp.headers;
            }
            builder
                .body(axum::body::Body::from(resp.body))
                .unwrap()
                .into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
