//! Durable persistence, behind a trait (spec.md §3 Non-goals: "Persistent
//! storage engine itself ... assumed to be a transactional relational
//! store; the spec describes only the schema and invariants the core
//! depends on").
//!
//! `MemStore` is the in-process reference implementation used by tests
//! and local runs. `PgStore` satisfies the "transactional relational
//! store" assumption against real Postgres.

mod memory;
mod postgres;

pub use memory::MemStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::ids::{ApiKeyId, MerkleRootId, ServiceId};
use crate::model::{ApiKey, BotDetectionLog, MerkleRoot, RequestHash, Service};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A closed batch, ready to be persisted in one transaction
/// (spec.md §4.5 step 3-4).
pub struct NewBatch {
    pub root: [u8; 32],
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub request_ids: Vec<i64>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // -- KeyDirectory -----------------------------------------------------

    /// Resolves a presented secret to its key and owning service, iff the
    /// key exists, is active, and its service exists (spec.md §4.1).
    async fn resolve_key(&self, secret: &str) -> Result<Option<(ApiKey, Service)>, StoreError>;

    async fn get_service(&self, id: ServiceId) -> Result<Option<Service>, StoreError>;

    // -- Control plane (creation/toggling; spec.md §6) ---------------------

    async fn create_service(&self, service: Service) -> Result<Service, StoreError>;

    async fn create_api_key(&self, key: ApiKey) -> Result<ApiKey, StoreError>;

    async fn get_api_key(&self, id: ApiKeyId) -> Result<Option<ApiKey>, StoreError>;

    async fn revoke_api_key(&self, id: ApiKeyId) -> Result<(), StoreError>;

    async fn set_rate_limit(
        &self,
        id: ApiKeyId,
        requests: u32,
        window_seconds: u32,
    ) -> Result<(), StoreError>;

    async fn set_watermarking(&self, service_id: ServiceId, enabled: bool) -> Result<(), StoreError>;

    async fn set_bot_blocking(&self, service_id: ServiceId, enabled: bool) -> Result<(), StoreError>;

    // -- Usage / billing ---------------------------------------------------

    /// Appends a `UsageLog` row and adds `price_per_request` to the key's
    /// `total_cost`, as one unit (spec.md §4.6 step 12).
    async fn record_usage_and_bill(
        &self,
        service_id: ServiceId,
        api_key_id: ApiKeyId,
        api_key_secret: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Count of `UsageLog` rows for this key's secret within the last
    /// `window` ending at `now` (used by the bot classifier's rate score
    /// and by `/overview`-style rate-limit usage reporting).
    async fn count_usage_since(
        &self,
        api_key_secret: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    // -- Transparency log ---------------------------------------------------

    /// Appends a `RequestHash` row with `merkle_batch_id = null`
    /// (spec.md §4.5).
    async fn commit_request_hash(&self, row: RequestHash) -> Result<i64, StoreError>;

    /// Returns the oldest `batch_size` unbatched hashes ordered by
    /// timestamp then id, or fewer if not enough exist yet
    /// (spec.md §4.5 step 1).
    async fn oldest_unbatched_hashes(
        &self,
        batch_size: usize,
    ) -> Result<Vec<RequestHash>, StoreError>;

    /// Atomically inserts the batch row and reassigns the given hash ids
    /// to it (spec.md §4.5 steps 3-4), returning the new batch's id. Must
    /// not double-assign a hash already claimed by a concurrent batcher.
    async fn close_batch(&self, batch: NewBatch) -> Result<MerkleRootId, StoreError>;

    async fn get_merkle_root(&self, id: MerkleRootId) -> Result<Option<MerkleRoot>, StoreError>;

    async fn latest_merkle_root(&self) -> Result<Option<MerkleRoot>, StoreError>;

    /// Reverse-chronological page, newest first.
    async fn merkle_history(&self, limit: usize, offset: usize) -> Result<Vec<MerkleRoot>, StoreError>;

    async fn hashes_in_batch(&self, batch_id: MerkleRootId) -> Result<Vec<RequestHash>, StoreError>;

    async fn mark_batch_anchored(
        &self,
        id: MerkleRootId,
        tx_hash: String,
        block_number: u64,
        anchored_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    // -- Bot detection -------------------------------------------------------

    /// Best-effort: failures must never fail the originating request
    /// (spec.md §4.3).
    async fn record_bot_detection(&self, row: BotDetectionLog) -> Result<(), StoreError>;
}
