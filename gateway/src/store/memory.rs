//! In-process `Store` implementation, grounded on the teacher's use of
//! `dashmap` for shared, read-mostly maps and `parking_lot::Mutex` for
//! short critical sections (the bucket map in `limiter` follows the same
//! pattern). Used by the test suite and by local/dev runs without a
//! database.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::ids::{ApiKeyId, MerkleRootId, ServiceId};
use crate::model::{ApiKey, BotDetectionLog, MerkleRoot, RequestHash, Service, UsageLog};

use super::{NewBatch, Store, StoreError};

#[derive(Default)]
pub struct MemStore {
    services: DashMap<ServiceId, Service>,
    next_service_id: AtomicI64,

    api_keys: DashMap<ApiKeyId, ApiKey>,
    secret_index: DashMap<String, ApiKeyId>,
    next_key_id: AtomicI64,

    usage_logs: Mutex<Vec<UsageLog>>,
    next_usage_id: AtomicI64,

    // Ordered by insertion (== ascending id), as the tie-breaker in
    // spec.md §4.5 step 1 requires.
    request_hashes: Mutex<Vec<RequestHash>>,
    next_hash_id: AtomicI64,

    merkle_roots: Mutex<Vec<MerkleRoot>>,
    next_batch_id: AtomicI64,

    bot_logs: Mutex<Vec<BotDetectionLog>>,
    next_bot_id: AtomicI64,

    // Serializes batch assignment the way a unique constraint or
    // serializable transaction would (spec.md §4.5: "MUST hold a row
    // lock sufficient to prevent two concurrent batchers from claiming
    // overlapping rows").
    batch_close_lock: Mutex<()>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/dev convenience: insert a service directly with a chosen id.
    pub fn seed_service(&self, service: Service) {
        self.services.insert(service.id, service);
    }

    pub fn seed_api_key(&self, key: ApiKey) {
        self.secret_index.insert(key.secret.clone(), key.id);
        self.api_keys.insert(key.id, key);
    }
}

#[async_trait]
impl Store for MemStore {
    async fn resolve_key(&self, secret: &str) -> Result<Option<(ApiKey, Service)>, StoreError> {
        let Some(key_id) = self.secret_index.get(secret).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(key) = self.api_keys.get(&key_id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        if !key.is_active {
            return Ok(None);
        }
        let Some(service) = self.services.get(&key.service_id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        Ok(Some((key, service)))
    }

    async fn get_service(&self, id: ServiceId) -> Result<Option<Service>, StoreError> {
        Ok(self.services.get(&id).map(|e| e.value().clone()))
    }

    async fn create_service(&self, mut service: Service) -> Result<Service, StoreError> {
        let id = ServiceId(self.next_service_id.fetch_add(1, Ordering::Relaxed) + 1);
        service.id = id;
        self.services.insert(id, service.clone());
        Ok(service)
    }

    async fn create_api_key(&self, mut key: ApiKey) -> Result<ApiKey, StoreError> {
        if self.secret_index.contains_key(&key.secret) {
            return Err(StoreError::Backend("duplicate api key secret".into()));
        }
        let id = ApiKeyId(self.next_key_id.fetch_add(1, Ordering::Relaxed) + 1);
        key.id = id;
        self.secret_index.insert(key.secret.clone(), id);
        self.api_keys.insert(id, key.clone());
        Ok(key)
    }

    async fn get_api_key(&self, id: ApiKeyId) -> Result<Option<ApiKey>, StoreError> {
        Ok(self.api_keys.get(&id).map(|e| e.value().clone()))
    }

    async fn revoke_api_key(&self, id: ApiKeyId) -> Result<(), StoreError> {
        match self.api_keys.get_mut(&id) {
            Some(mut e) => {
                e.is_active = false;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn set_rate_limit(
        &self,
        id: ApiKeyId,
        requests: u32,
        window_seconds: u32,
    ) -> Result<(), StoreError> {
        match self.api_keys.get_mut(&id) {
            Some(mut e) => {
                e.rate_limit_requests = Some(requests);
                e.rate_limit_window_seconds = Some(window_seconds);
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn set_watermarking(&self, service_id: ServiceId, enabled: bool) -> Result<(), StoreError> {
        match self.services.get_mut(&service_id) {
            Some(mut e) => {
                e.watermarking_enabled = enabled;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn set_bot_blocking(&self, service_id: ServiceId, enabled: bool) -> Result<(), StoreError> {
        match self.services.get_mut(&service_id) {
            Some(mut e) => {
                e.bot_blocking_enabled = enabled;
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn record_usage_and_bill(
        &self,
        service_id: ServiceId,
        api_key_id: ApiKeyId,
        api_key_secret: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let price = {
            let mut entry = self
                .api_keys
                .get_mut(&api_key_id)
                .ok_or(StoreError::NotFound)?;
            entry.total_cost += entry.price_per_request;
            entry.price_per_request
        };
        let _ = price;
        let id = self.next_usage_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.usage_logs.lock().push(UsageLog {
            id,
            service_id,
            api_key_secret: api_key_secret.to_string(),
            timestamp,
        });
        Ok(())
    }

    async fn count_usage_since(
        &self,
        api_key_secret: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let logs = self.usage_logs.lock();
        Ok(logs
            .iter()
            .filter(|l| l.api_key_secret == api_key_secret && l.timestamp >= since)
            .count() as u64)
    }

    async fn commit_request_hash(&self, mut row: RequestHash) -> Result<i64, StoreError> {
        let id = self.next_hash_id.fetch_add(1, Ordering::Relaxed) + 1;
        row.id = id;
        self.request_hashes.lock().push(row);
        Ok(id)
    }

    async fn oldest_unbatched_hashes(
        &self,
        batch_size: usize,
    ) -> Result<Vec<RequestHash>, StoreError> {
        let hashes = self.request_hashes.lock();
        let mut unbatched: Vec<RequestHash> = hashes
            .iter()
            .filter(|h| h.merkle_batch_id.is_none())
            .cloned()
            .collect();
        // Rows are already insertion-ordered (== id ascending); timestamps
        // are monotonic with id in practice, but sort defensively by
        // (timestamp, id) to match the spec's explicit tie-breaker.
        unbatched.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        unbatched.truncate(batch_size);
        Ok(unbatched)
    }

    async fn close_batch(&self, batch: NewBatch) -> Result<MerkleRootId, StoreError> {
        let _guard = self.batch_close_lock.lock();

        // Re-validate under the lock: none of these ids may already be
        // claimed by a concurrent batcher.
        {
            let hashes = self.request_hashes.lock();
            for id in &batch.request_ids {
                let Some(row) = hashes.iter().find(|h| h.id == *id) else {
                    return Err(StoreError::Backend(format!("hash {id} vanished")));
                };
                if row.merkle_batch_id.is_some() {
                    return Err(StoreError::Backend(format!(
                        "hash {id} already claimed by another batch"
                    )));
                }
            }
        }

        let batch_id = MerkleRootId(self.next_batch_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.merkle_roots.lock().push(MerkleRoot {
            id: batch_id,
            root: batch.root,
            start_time: batch.start_time,
            end_time: batch.end_time,
            request_count: batch.request_ids.len() as u32,
            created_at: Utc::now(),
            is_anchored: false,
            tx_hash: None,
            block_number: None,
            anchored_at: None,
        });

        let mut hashes = self.request_hashes.lock();
        for row in hashes.iter_mut() {
            if batch.request_ids.contains(&row.id) {
                row.merkle_batch_id = Some(batch_id);
            }
        }

        Ok(batch_id)
    }

    async fn get_merkle_root(&self, id: MerkleRootId) -> Result<Option<MerkleRoot>, StoreError> {
        Ok(self.merkle_roots.lock().iter().find(|r| r.id == id).cloned())
    }

    async fn latest_merkle_root(&self) -> Result<Option<MerkleRoot>, StoreError> {
        Ok(self.merkle_roots.lock().iter().max_by_key(|r| r.id.0).cloned())
    }

    async fn merkle_history(&self, limit: usize, offset: usize) -> Result<Vec<MerkleRoot>, StoreError> {
        let mut roots = self.merkle_roots.lock().clone();
        roots.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(roots.into_iter().skip(offset).take(limit).collect())
    }

    async fn hashes_in_batch(&self, batch_id: MerkleRootId) -> Result<Vec<RequestHash>, StoreError> {
        let hashes = self.request_hashes.lock();
        let mut out: Vec<RequestHash> = hashes
            .iter()
            .filter(|h| h.merkle_batch_id == Some(batch_id))
            .cloned()
            .collect();
        out.sort_by_key(|h| h.id);
        Ok(out)
    }

    async fn mark_batch_anchored(
        &self,
        id: MerkleRootId,
        tx_hash: String,
        block_number: u64,
        anchored_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut roots = self.merkle_roots.lock();
        let Some(root) = roots.iter_mut().find(|r| r.id == id) else {
            return Err(StoreError::NotFound);
        };
        root.is_anchored = true;
        root.tx_hash = Some(tx_hash);
        root.block_number = Some(block_number);
        root.anchored_at = Some(anchored_at);
        Ok(())
    }

    async fn record_bot_detection(&self, mut row: BotDetectionLog) -> Result<(), StoreError> {
        let id = self.next_bot_id.fetch_add(1, Ordering::Relaxed) + 1;
        row.id = id;
        self.bot_logs.lock().push(row);
        Ok(())
    }
}
