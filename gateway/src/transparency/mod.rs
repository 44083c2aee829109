//! The transparency log (spec.md §4.5): per-request hash commitments,
//! fixed-size Merkle batching, and (optionally) asynchronous blockchain
//! anchoring. `ProxyEngine` calls `commit_and_maybe_batch` once per
//! proxied request; everything here is best-effort with respect to the
//! caller's response, per spec.md §7.

pub mod anchor;
pub mod commitment;
pub mod merkle;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::AppConfig;
use crate::ids::{ApiKeyId, MerkleRootId, ServiceId};
use crate::metrics;
use crate::model::{MerkleRoot, RequestHash};
use crate::store::{NewBatch, Store};

pub use anchor::{AnchorHandle, AnchorJob};

pub struct TransparencyLog {
    store: Arc<dyn Store>,
    anchor: AnchorHandle,
    batch_size: usize,
}

impl TransparencyLog {
    pub fn new(store: Arc<dyn Store>, anchor: AnchorHandle, config: &AppConfig) -> Self {
        Self {
            store,
            anchor,
            batch_size: config.merkle_batch_size,
        }
    }

    /// Computes and commits the hash for one proxied request (success or
    /// failure), then opportunistically attempts to close a batch
    /// (spec.md §4.5). Never returns an error to the caller: both steps
    /// are best-effort, and a failure at either is only logged.
    pub async fn commit_and_maybe_batch(
        &self,
        service_id: ServiceId,
        api_key_id: ApiKeyId,
        timestamp: DateTime<Utc>,
        request_path: &str,
        response_status: u16,
    ) {
        let hash = commitment::compute_request_hash(
            service_id,
            api_key_id,
            timestamp,
            request_path,
            response_status,
        );
        let row = RequestHash {
            id: 0,
            service_id,
            api_key_id,
            timestamp,
            request_path: request_path.to_string(),
            response_status,
            hash,
            merkle_batch_id: None,
        };
        if let Err(e) = self.store.commit_request_hash(row).await {
            tracing::warn!(error = %e, "failed to commit request hash");
            metrics::record_commit_failure("request_hash");
            return;
        }

        if let Err(e) = self.try_close_batch().await {
            tracing::warn!(error = %e, "failed to close merkle batch");
            metrics::record_commit_failure("merkle_batch");
        }
    }

    /// Closes one batch if at least `batch_size` unbatched hashes exist
    /// (spec.md §4.5 steps 1-5). A no-op (not an error) if fewer exist.
    async fn try_close_batch(&self) -> Result<(), crate::store::StoreError> {
        let candidates = self.store.oldest_unbatched_hashes(self.batch_size).await?;
        if candidates.len() < self.batch_size {
            return Ok(());
        }

        let hashes: Vec<[u8; 32]> = candidates.iter().map(|h| h.hash).collect();
        // `batch_size >= 1` always holds (spec.md §4.5 default 10, and a
        // deployment configuring 0 would never close a batch above), so
        // `build_merkle_tree` never returns `None` here.
        let root = merkle::build_merkle_tree(&hashes).expect("non-empty candidate batch");

        let batch = NewBatch {
            root,
            start_time: candidates.first().unwrap().timestamp,
            end_time: candidates.last().unwrap().timestamp,
            request_ids: candidates.iter().map(|h| h.id).collect(),
        };
        let batch_id = self.store.close_batch(batch).await?;
        metrics::record_merkle_batch_closed();

        self.anchor.submit(AnchorJob {
            batch_id,
            root,
            request_count: candidates.len() as u32,
        });
        Ok(())
    }

    pub async fn latest_root(&self) -> Result<Option<MerkleRoot>, crate::store::StoreError> {
        self.store.latest_merkle_root().await
    }

    pub async fn history(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<MerkleRoot>, crate::store::StoreError> {
        self.store.merkle_history(limit, offset).await
    }

    /// Returns the ordered hash list for a batch plus the root recomputed
    /// from them, so a caller can verify the stored root independently
    /// (spec.md §6 `/transparency/verify/{batch_id}`).
    pub async fn verify_batch(
        &self,
        batch_id: MerkleRootId,
    ) -> Result<Option<BatchVerification>, crate::store::StoreError> {
        let Some(root_row) = self.store.get_merkle_root(batch_id).await? else {
            return Ok(None);
        };
        let hashes = self.store.hashes_in_batch(batch_id).await?;
        let recomputed: Vec<[u8; 32]> = hashes.iter().map(|h| h.hash).collect();
        let expected_root = merkle::build_merkle_tree(&recomputed);
        Ok(Some(BatchVerification {
            root: root_row,
            hashes,
            recomputed_root_matches: expected_root == Some(root_row_root(&root_row)),
        }))
    }
}

fn root_row_root(root: &MerkleRoot) -> [u8; 32] {
    root.root
}

pub struct BatchVerification {
    pub root: MerkleRoot,
    pub hashes: Vec<RequestHash>,
    pub recomputed_root_matches: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;
    use clap::Parser;

    fn config_with_batch_size(n: usize) -> AppConfig {
        let mut cfg = AppConfig::parse_from(["gateway"]);
        cfg.merkle_batch_size = n;
        cfg
    }

    #[tokio::test]
    async fn commits_below_batch_size_leave_batch_open() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let log = TransparencyLog::new(store.clone(), AnchorHandle::disabled(), &config_with_batch_size(4));

        for i in 0..3 {
            log.commit_and_maybe_batch(
                ServiceId(1),
                ApiKeyId(1),
                Utc::now(),
                &format!("/proxy/1/{i}"),
                200,
            )
            .await;
        }
        assert!(log.latest_root().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reaching_batch_size_closes_exactly_one_batch() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let log = TransparencyLog::new(store.clone(), AnchorHandle::disabled(), &config_with_batch_size(4));

        for i in 0..4 {
            log.commit_and_maybe_batch(
                ServiceId(1),
                ApiKeyId(1),
                Utc::now(),
                &format!("/proxy/1/{i}"),
                200,
            )
            .await;
        }
        let root = log.latest_root().await.unwrap().expect("batch should be closed");
        assert_eq!(root.request_count, 4);
        assert!(!root.is_anchored);
    }

    #[tokio::test]
    async fn verify_batch_recomputes_a_matching_root() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new());
        let log = TransparencyLog::new(store.clone(), AnchorHandle::disabled(), &config_with_batch_size(2));

        log.commit_and_maybe_batch(ServiceId(1), ApiKeyId(1), Utc::now(), "/proxy/1/a", 200)
            .await;
        log.commit_and_maybe_batch(ServiceId(1), ApiKeyId(1), Utc::now(), "/proxy/1/b", 200)
            .await;

        let root = log.latest_root().await.unwrap().unwrap();
        let verification = log.verify_batch(root.id).await.unwrap().unwrap();
        assert!(verification.recomputed_root_matches);
        assert_eq!(verification.hashes.len(), 2);
    }
}
