//! The slice of control-plane routes the core subsystems are exercised
//! through (spec.md §6, SPEC_FULL.md §6). Thin adapters over
//! `Store`/`Watermarker`/`TransparencyLog` — no pipeline logic lives
//! here, only request/response shaping.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::Utc;
use gateway_util::{json_ok, ApiError};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ids::{ApiKeyId, MerkleRootId, ServiceId};
use crate::model::{ApiKey, Service};
use crate::watermark::Watermarker;

use super::AppState;

fn store_err(e: crate::store::StoreError) -> ApiError {
    match e {
        crate::store::StoreError::NotFound => ApiError::NotFound("not found".into()),
        crate::store::StoreError::Backend(msg) => ApiError::Internal(msg),
    }
}

/// Generates a key secret with >=32 bytes of entropy (spec.md §3), as a
/// prefixed hex string so it is recognizable as a gateway credential at a
/// glance (a 20-byte/160-bit body, well above the floor).
fn generate_secret() -> String {
    let raw: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect();
    format!("sk_live_{raw}")
}

// -- /register-api --------------------------------------------------------

#[derive(Deserialize)]
pub struct RegisterApiRequest {
    pub name: String,
    pub target_url: String,
    pub owner_id: i64,
}

#[derive(Serialize)]
pub struct RegisterApiResponse {
    pub service: Service,
}

pub async fn register_api(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterApiRequest>,
) -> Result<axum::response::Response, ApiError> {
    let service = Service {
        id: ServiceId(0),
        name: req.name,
        target_url: req.target_url,
        owner_id: req.owner_id,
        watermarking_enabled: false,
        bot_blocking_enabled: false,
        bot_threshold: Service::DEFAULT_BOT_THRESHOLD,
    };
    let created = state.store.create_service(service).await.map_err(store_err)?;
    Ok(json_ok(RegisterApiResponse { service: created }))
}

// -- /services/{id}/keys --------------------------------------------------

#[derive(Deserialize, Default)]
pub struct CreateApiKeyRequest {
    pub rate_limit_requests: Option<u32>,
    pub rate_limit_window_seconds: Option<u32>,
    #[serde(default)]
    pub price_per_request: f64,
}

#[derive(Serialize)]
pub struct CreateApiKeyResponse {
    pub id: ApiKeyId,
    /// Returned exactly once (spec.md §6): the caller must store it, the
    /// gateway never discloses it again.
    pub secret: String,
}

pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<i64>,
    Json(req): Json<CreateApiKeyRequest>,
) -> Result<axum::response::Response, ApiError> {
    let service_id = ServiceId(service_id);
    if state.store.get_service(service_id).await.map_err(store_err)?.is_none() {
        return Err(ApiError::NotFound(format!("unknown service {service_id}")));
    }
    let secret = generate_secret();
    let key = ApiKey {
        id: ApiKeyId(0),
        secret: secret.clone(),
        service_id,
        is_active: true,
        created_at: Utc::now(),
        rate_limit_requests: req.rate_limit_requests,
        rate_limit_window_seconds: req.rate_limit_window_seconds,
        price_per_request: req.price_per_request,
        total_cost: 0.0,
    };
    let created = state.store.create_api_key(key).await.map_err(store_err)?;
    Ok(json_ok(CreateApiKeyResponse {
        id: created.id,
        secret,
    }))
}

// -- /api-keys/{id}/rate-limit ---------------------------------------------

#[derive(Deserialize)]
pub struct SetRateLimitRequest {
    pub requests: u32,
    pub window_seconds: u32,
}

pub async fn set_rate_limit(
    State(state): State<Arc<AppState>>,
    Path(key_id): Path<i64>,
    Json(req): Json<SetRateLimitRequest>,
) -> Result<axum::response::Response, ApiError> {
    state
        .store
        .set_rate_limit(ApiKeyId(key_id), req.requests, req.window_seconds)
        .await
        .map_err(store_err)?;
    Ok(json_ok(serde_json::json!({ "ok": true })))
}

// -- /services/{id}/keys/{kid}/revoke ---------------------------------------

pub async fn revoke_api_key(
    State(state): State<Arc<AppState>>,
    Path((_service_id, key_id)): Path<(i64, i64)>,
) -> Result<axum::response::Response, ApiError> {
    state
        .store
        .revoke_api_key(ApiKeyId(key_id))
        .await
        .map_err(store_err)?;
    Ok(json_ok(serde_json::json!({ "ok": true })))
}

// -- /services/{id}/watermarking --------------------------------------------

#[derive(Deserialize)]
pub struct ToggleRequest {
    pub enabled: bool,
}

pub async fn set_watermarking(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<i64>,
    Json(req): Json<ToggleRequest>,
) -> Result<axum::response::Response, ApiError> {
    state
        .store
        .set_watermarking(ServiceId(service_id), req.enabled)
        .await
        .map_err(store_err)?;
    Ok(json_ok(serde_json::json!({ "watermarking_enabled": req.enabled })))
}

pub async fn get_watermarking(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<i64>,
) -> Result<axum::response::Response, ApiError> {
    let service = state
        .store
        .get_service(ServiceId(service_id))
        .await
        .map_err(store_err)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown service {service_id}")))?;
    Ok(json_ok(
        serde_json::json!({ "watermarking_enabled": service.watermarking_enabled }),
    ))
}

// -- /services/{id}/bot-blocking ---------------------------------------------

pub async fn set_bot_blocking(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<i64>,
    Json(req): Json<ToggleRequest>,
) -> Result<axum::response::Response, ApiError> {
    state
        .store
        .set_bot_blocking(ServiceId(service_id), req.enabled)
        .await
        .map_err(store_err)?;
    Ok(json_ok(serde_json::json!({ "bot_blocking_enabled": req.enabled })))
}

// -- /watermark/verify --------------------------------------------------------

#[derive(Deserialize)]
pub struct VerifyWatermarkRequest {
    pub body: String,
}

#[derive(Serialize)]
pub struct VerifyWatermarkResponse {
    pub watermark: String,
    pub service_id: ServiceId,
    pub api_key_id: ApiKeyId,
    pub request_id: String,
    pub timestamp_iso: String,
    pub service_name: Option<String>,
}

pub async fn verify_watermark(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyWatermarkRequest>,
) -> Result<axum::response::Response, ApiError> {
    let Some(watermark) = Watermarker::extract(&req.body) else {
        return Err(ApiError::BadRequest("no watermark found in body".into()));
    };
    let tuple = Watermarker::decode(&watermark).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let service_name = state
        .store
        .get_service(tuple.service_id)
        .await
        .map_err(store_err)?
        .map(|s| s.name);

    Ok(json_ok(VerifyWatermarkResponse {
        watermark,
        service_id: tuple.service_id,
        api_key_id: tuple.api_key_id,
        request_id: tuple.request_id,
        timestamp_iso: tuple.timestamp_iso,
        service_name,
    }))
}

// -- /transparency/* ----------------------------------------------------------

pub async fn merkle_latest(State(state): State<Arc<AppState>>) -> Result<axum::response::Response, ApiError> {
    let root = state.transparency.latest_root().await.map_err(store_err)?;
    match root {
        Some(r) => Ok(json_ok(r)),
        None => Err(ApiError::NotFound("no batches closed yet".into())),
    }
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    20
}

pub async fn merkle_history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<HistoryQuery>,
) -> Result<axum::response::Response, ApiError> {
    let history = state
        .transparency
        .history(q.limit, q.offset)
        .await
        .map_err(store_err)?;
    Ok(json_ok(history))
}

#[derive(Serialize)]
pub struct VerifyBatchResponse {
    pub batch_id: MerkleRootId,
    pub expected_root: String,
    pub recomputed_root_matches: bool,
    pub hash_count: usize,
    pub hashes: Vec<String>,
}

pub async fn verify_batch(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<i64>,
) -> Result<axum::response::Response, ApiError> {
    let batch_id = MerkleRootId(batch_id);
    let verification = state
        .transparency
        .verify_batch(batch_id)
        .await
        .map_err(store_err)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown batch {batch_id}")))?;

    Ok(json_ok(VerifyBatchResponse {
        batch_id,
        expected_root: hex::encode(verification.root.root),
        recomputed_root_matches: verification.recomputed_root_matches,
        hash_count: verification.hashes.len(),
        hashes: verification.hashes.iter().map(|h| hex::encode(h.hash)).collect(),
    }))
}

#[derive(Serialize)]
#[serde(tag = "status")]
pub enum BlockchainStatusResponse {
    #[serde(rename = "anchored")]
    Anchored {
        tx_hash: String,
        block_number: u64,
        anchored_at: chrono::DateTime<Utc>,
    },
    #[serde(rename = "not_anchored")]
    NotAnchored,
}

pub async fn blockchain_status(
    State(state): State<Arc<AppState>>,
    Path(batch_id): Path<i64>,
) -> Result<axum::response::Response, ApiError> {
    let root = state
        .store
        .get_merkle_root(MerkleRootId(batch_id))
        .await
        .map_err(store_err)?
        .ok_or_else(|| ApiError::NotFound(format!("unknown batch {batch_id}")))?;

    let response = match (root.is_anchored, root.tx_hash, root.block_number, root.anchored_at) {
        (true, Some(tx_hash), Some(block_number), Some(anchored_at)) => {
            BlockchainStatusResponse::Anchored { tx_hash, block_number, anchored_at }
        }
        _ => BlockchainStatusResponse::NotAnchored,
    };
    Ok(json_ok(response))
}
